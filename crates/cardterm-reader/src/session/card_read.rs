//! Card read: on tap, select the schema's application and read its files.

use std::collections::BTreeMap;
use std::time::Duration;

use cardterm_hardware::{CardTap, HardwareError};
use serde::Serialize;
use tracing::{debug, info};

use crate::apdu;
use crate::config::{FieldEncoding, ResolvedSchema, SchemaFile};
use crate::error::{ReaderError, Result};
use crate::runtime::RuntimeHandle;
use crate::session::orchestrator::SessionOperation;
use crate::status::StatusSnapshot;

#[derive(Debug, Clone)]
pub struct CardReadParams {
    pub schema: ResolvedSchema,
    /// Tap wait; the configured default when absent.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardReadResult {
    pub uid: String,
    pub card_type: String,
    pub schema: String,
    pub fields: BTreeMap<String, String>,
}

pub struct CardReadOperation {
    runtime: RuntimeHandle,
}

impl CardReadOperation {
    pub fn new(runtime: RuntimeHandle) -> Self {
        Self { runtime }
    }

    async fn read_file(&self, file: &SchemaFile) -> Result<String> {
        let response = self
            .runtime
            .card_apdu(apdu::read_binary(file.sfi, file.offset, file.length))
            .await?;
        if !response.is_success() {
            return Err(ReaderError::status_word(
                format!("READ BINARY of {}", file.field),
                response.sw,
            ));
        }
        debug!(field = %file.field, len = response.data.len(), "Card file read");
        Ok(decode_field(&response.data, file.encoding))
    }
}

impl SessionOperation for CardReadOperation {
    type Params = CardReadParams;
    type Output = CardReadResult;
    const SOURCE_TAG: &'static str = "card_read";

    fn check_preconditions(&self, status: &StatusSnapshot, _params: &CardReadParams) -> Result<()> {
        if !status.is_ready_for_cards() {
            return Err(ReaderError::precondition("reader is not ready for card reads"));
        }
        Ok(())
    }

    fn tap_timeout(&self, params: &CardReadParams) -> Option<Duration> {
        params.timeout
    }

    async fn execute(&self, params: CardReadParams, tap: CardTap) -> Result<CardReadResult> {
        if !tap.card_type.supports_apdu() {
            return Err(HardwareError::card_read(format!(
                "{} cards cannot be read with a schema",
                tap.card_type.name()
            ))
            .into());
        }

        let schema = params.schema;
        let response = self.runtime.card_apdu(apdu::select(&schema.aid)).await?;
        if !response.is_success() {
            return Err(ReaderError::status_word("SELECT application", response.sw));
        }

        let mut fields = BTreeMap::new();
        for file in &schema.files {
            fields.insert(file.field.clone(), self.read_file(file).await?);
        }

        info!(uid = %tap.uid_hex(), schema = %schema.name, fields = fields.len(), "Card read");
        Ok(CardReadResult {
            uid: tap.uid_hex(),
            card_type: tap.card_type.name().to_string(),
            schema: schema.name,
            fields,
        })
    }
}

/// Render file bytes per the schema encoding.
fn decode_field(data: &[u8], encoding: FieldEncoding) -> String {
    match encoding {
        FieldEncoding::Hex => hex::encode_upper(data),
        FieldEncoding::Ascii => {
            let end = data
                .iter()
                .rposition(|b| !matches!(b, 0x00 | 0xFF | b' '))
                .map_or(0, |last| last + 1);
            data[..end]
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect()
        }
    }
}
