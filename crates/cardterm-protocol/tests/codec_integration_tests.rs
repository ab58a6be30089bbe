//! Codec tests over a real TCP socket pair.

use cardterm_core::SubProtocol;
use cardterm_protocol::{
    CommandCode, Correlator, DecodedFrame, FrameCodec, Message, ProtocolError, ResponseCode,
};
use futures::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (client, server)
}

#[tokio::test]
async fn test_request_response_over_tcp() {
    let (client, server) = socket_pair().await;
    let mut client = Framed::new(client, FrameCodec::for_protocol(SubProtocol::Transit));
    let mut server = Framed::new(server, FrameCodec::for_protocol(SubProtocol::Transit));

    client
        .send(Message::request(CommandCode::SamAtr).with_slot(1))
        .await
        .unwrap();

    let request = match server.next().await {
        Some(Ok(DecodedFrame::Message(m))) => m,
        other => panic!("unexpected frame: {other:?}"),
    };
    assert_eq!(request.command, CommandCode::SamAtr);
    assert_eq!(request.slot(), Some(1));

    server
        .send(
            Message::response(CommandCode::SamAtr, ResponseCode::Success)
                .with_slot(1)
                .with_atr(vec![0x3B, 0x02, 0x14, 0x50]),
        )
        .await
        .unwrap();

    let mut correlator: Correlator<Vec<Vec<u8>>> = Correlator::new();
    correlator
        .register(
            request,
            Instant::now() + Duration::from_secs(1),
            Box::new(|atrs: &mut Vec<Vec<u8>>, _req, resp| {
                if let Some(atr) = resp.as_ref().and_then(|r| r.atr()) {
                    atrs.push(atr.to_vec());
                }
            }),
        )
        .unwrap();

    let response = match client.next().await {
        Some(Ok(DecodedFrame::Message(m))) => m,
        other => panic!("unexpected frame: {other:?}"),
    };
    let (pending, response) = correlator.resolve(response).unwrap();
    let mut atrs = Vec::new();
    pending.complete(&mut atrs, Some(response));
    assert_eq!(atrs, vec![vec![0x3B, 0x02, 0x14, 0x50]]);
}

#[tokio::test]
async fn test_oversized_frame_terminates_stream() {
    let (client, mut server) = socket_pair().await;
    let mut client = Framed::new(
        client,
        FrameCodec::for_protocol(SubProtocol::Ifsf).with_max_frame_size(128),
    );

    server.write_all(&[0x10, 0x00]).await.unwrap();

    match client.next().await {
        Some(Err(ProtocolError::FrameTooLarge { size, max_size })) => {
            assert_eq!(size, 0x1000);
            assert_eq!(max_size, 128);
        }
        other => panic!("expected FrameTooLarge, got {other:?}"),
    }
}

#[tokio::test]
async fn test_byte_order_mismatch_is_detected() {
    // A transit peer talking to an IFSF decoder: a 4-byte payload announced
    // little-endian reads as 1024 bytes big-endian and never completes.
    let (client, server) = socket_pair().await;
    let mut sender = Framed::new(server, FrameCodec::for_protocol(SubProtocol::Transit));
    let mut receiver = Framed::new(
        client,
        FrameCodec::for_protocol(SubProtocol::Ifsf).with_max_frame_size(512),
    );

    sender
        .send(Message::request(CommandCode::Diagnostics))
        .await
        .unwrap();

    assert!(matches!(
        receiver.next().await,
        Some(Err(ProtocolError::FrameTooLarge { .. }))
    ));
}
