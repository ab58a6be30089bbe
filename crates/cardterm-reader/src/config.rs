//! Reader configuration.
//!
//! [`ReaderConfig`] is the deserializable form: plain values, hex strings
//! for keys and identifiers, durations in milliseconds. [`ReaderConfig::resolve`]
//! validates it once at startup and produces [`ReaderSettings`], the form
//! the runtime works with (decoded bytes, zeroized key).
//!
//! ```
//! use cardterm_reader::ReaderConfig;
//!
//! let config: ReaderConfig = serde_json::from_str(r#"{
//!     "transit": { "addr": "10.0.0.5:9100" },
//!     "ifsf": { "addr": "10.0.0.5:9101" },
//!     "timing": { "post_reboot_grace_ms": 8000 }
//! }"#).unwrap();
//!
//! let settings = config.resolve().unwrap();
//! assert_eq!(settings.timing.post_reboot_grace_ms, 8000);
//! assert!(settings.schema("default").is_some());
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use cardterm_core::constants::*;
use cardterm_core::{Error, Result, decode_hex};
use cardterm_hardware::HardwareMode;
use cardterm_network::LinkConfig;
use serde::Deserialize;
use zeroize::Zeroizing;

/// Name of the schema used when a card read does not ask for one.
pub const DEFAULT_SCHEMA: &str = "default";

/// Top-level reader configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Transit sub-protocol link (also carries SAM traffic)
    pub transit: LinkConfig,

    /// Payment sub-protocol link
    pub ifsf: LinkConfig,

    pub timing: TimingConfig,

    pub sam: SamConfig,

    pub sessions: SessionConfig,

    /// Tap backend selection
    pub hardware: HardwareMode,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            transit: LinkConfig::default(),
            ifsf: LinkConfig {
                addr: SocketAddr::from(([127, 0, 0, 1], 9101)),
                ..LinkConfig::default()
            },
            timing: TimingConfig::default(),
            sam: SamConfig::default(),
            sessions: SessionConfig::default(),
            hardware: HardwareMode::default(),
        }
    }
}

impl ReaderConfig {
    /// Validate and decode the configuration.
    ///
    /// # Errors
    /// `Error::Config` or `Error::InvalidHex` naming the offending field.
    pub fn resolve(&self) -> Result<ReaderSettings> {
        self.timing.validate()?;
        let sam = self.sam.resolve()?;
        let schemas = self
            .sessions
            .card_schemas
            .iter()
            .map(CardSchema::resolve)
            .collect::<Result<Vec<_>>>()?;

        for (i, schema) in schemas.iter().enumerate() {
            if schemas[..i].iter().any(|other| other.name == schema.name) {
                return Err(Error::config(format!(
                    "duplicate card schema name {:?}",
                    schema.name
                )));
            }
        }

        Ok(ReaderSettings {
            timing: self.timing.clone(),
            sam,
            sessions: self.sessions.clone(),
            schemas,
        })
    }
}

/// Timing parameters, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Scheduler tick period
    pub tick_interval_ms: u64,

    /// How long a correlated request waits for its response
    pub response_timeout_ms: u64,

    /// Added to the response timeout to obtain the init check period
    pub check_margin_ms: u64,

    /// Wait before ATR polling after a silent device reboot
    pub post_reboot_grace_ms: u64,

    /// Budget of each irreversible auth step, measured from entry
    pub irreversible_step_timeout_ms: u64,

    /// Period of the diagnostics exchange
    pub keepalive_interval_ms: u64,

    /// Unanswered keepalives before the app is declared dead
    pub keepalive_max_misses: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            check_margin_ms: DEFAULT_CHECK_MARGIN_MS,
            post_reboot_grace_ms: DEFAULT_POST_REBOOT_GRACE_MS,
            irreversible_step_timeout_ms: DEFAULT_IRREVERSIBLE_STEP_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            keepalive_max_misses: DEFAULT_KEEPALIVE_MAX_MISSES,
        }
    }
}

impl TimingConfig {
    fn validate(&self) -> Result<()> {
        let positive = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("irreversible_step_timeout_ms", self.irreversible_step_timeout_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config(format!("timing.{name} must be positive")));
        }
        if self.keepalive_max_misses == 0 {
            return Err(Error::config("timing.keepalive_max_misses must be positive"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Minimum spacing between two init checks.
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms + self.check_margin_ms)
    }

    pub fn post_reboot_grace(&self) -> Duration {
        Duration::from_millis(self.post_reboot_grace_ms)
    }

    pub fn irreversible_step_timeout(&self) -> Duration {
        Duration::from_millis(self.irreversible_step_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Secure module identification and key material, as hex strings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SamConfig {
    /// Expected ATR prefix of a supported module
    pub atr_signature: String,

    /// Expected GET DATA (SAM type) value
    pub sam_type: String,

    /// Expected GET DATA (network id) value
    pub network_id: String,

    /// Authentication key, 16 or 24 bytes
    pub auth_key: String,

    /// Information applet AID
    pub info_aid: String,

    /// Control applet AID
    pub ctrl_aid: String,
}

impl Default for SamConfig {
    fn default() -> Self {
        Self {
            atr_signature: "3B8F8001".to_string(),
            sam_type: "01".to_string(),
            network_id: "0001".to_string(),
            auth_key: "404142434445464748494A4B4C4D4E4F".to_string(),
            info_aid: "A000000077010800".to_string(),
            ctrl_aid: "A000000077010801".to_string(),
        }
    }
}

impl fmt::Debug for SamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamConfig")
            .field("atr_signature", &self.atr_signature)
            .field("sam_type", &self.sam_type)
            .field("network_id", &self.network_id)
            .field("auth_key", &"<redacted>")
            .field("info_aid", &self.info_aid)
            .field("ctrl_aid", &self.ctrl_aid)
            .finish()
    }
}

impl SamConfig {
    pub fn resolve(&self) -> Result<SamSettings> {
        let atr_signature = non_empty("sam.atr_signature", &self.atr_signature)?;
        let sam_type = non_empty("sam.sam_type", &self.sam_type)?;
        let network_id = non_empty("sam.network_id", &self.network_id)?;
        let info_aid = aid("sam.info_aid", &self.info_aid)?;
        let ctrl_aid = aid("sam.ctrl_aid", &self.ctrl_aid)?;

        let auth_key = Zeroizing::new(decode_hex("sam.auth_key", &self.auth_key)?);
        if auth_key.len() != 16 && auth_key.len() != 24 {
            return Err(Error::config(format!(
                "sam.auth_key must be 16 or 24 bytes, got {}",
                auth_key.len()
            )));
        }

        Ok(SamSettings {
            atr_signature,
            sam_type,
            network_id,
            auth_key,
            info_aid,
            ctrl_aid,
        })
    }
}

fn non_empty(field: &str, value: &str) -> Result<Vec<u8>> {
    let bytes = decode_hex(field, value)?;
    if bytes.is_empty() {
        return Err(Error::config(format!("{field} must not be empty")));
    }
    Ok(bytes)
}

fn aid(field: &str, value: &str) -> Result<Vec<u8>> {
    let bytes = decode_hex(field, value)?;
    if !(5..=16).contains(&bytes.len()) {
        return Err(Error::config(format!(
            "{field} must be 5-16 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decoded secure module settings.
#[derive(Clone)]
pub struct SamSettings {
    pub atr_signature: Vec<u8>,
    pub sam_type: Vec<u8>,
    pub network_id: Vec<u8>,
    pub auth_key: Zeroizing<Vec<u8>>,
    pub info_aid: Vec<u8>,
    pub ctrl_aid: Vec<u8>,
}

impl SamSettings {
    /// Whether `atr` identifies a supported module.
    pub fn matches_atr(&self, atr: &[u8]) -> bool {
        atr.starts_with(&self.atr_signature)
    }
}

impl fmt::Debug for SamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamSettings")
            .field("atr_signature", &hex::encode_upper(&self.atr_signature))
            .field("sam_type", &hex::encode_upper(&self.sam_type))
            .field("network_id", &hex::encode_upper(&self.network_id))
            .finish_non_exhaustive()
    }
}

/// Session lifetime and card read settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions older than this are evicted
    pub ttl_secs: u64,

    pub cleanup_interval_secs: u64,

    /// Default wait for a tap when the client does not give one
    pub tap_wait_timeout_ms: u64,

    pub card_schemas: Vec<CardSchema>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: SESSION_TTL_SECS,
            cleanup_interval_secs: DEFAULT_SESSION_CLEANUP_INTERVAL_SECS,
            tap_wait_timeout_ms: DEFAULT_TAP_WAIT_TIMEOUT_MS,
            card_schemas: vec![CardSchema::default()],
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn tap_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.tap_wait_timeout_ms)
    }
}

/// How the bytes of a card file are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldEncoding {
    Hex,
    /// Printable ASCII; trailing padding (`00`, `FF`, spaces) is stripped.
    Ascii,
}

/// One file of a card application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaFile {
    /// Output field name
    pub field: String,

    /// Short file identifier (1-30)
    pub sfi: u8,

    #[serde(default)]
    pub offset: u8,

    pub length: u8,

    pub encoding: FieldEncoding,
}

/// A named card layout: one application and the files to read from it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CardSchema {
    pub name: String,

    /// Application AID, hex
    pub aid: String,

    pub files: Vec<SchemaFile>,
}

impl Default for CardSchema {
    fn default() -> Self {
        Self {
            name: DEFAULT_SCHEMA.to_string(),
            aid: "A0000004040125".to_string(),
            files: vec![
                SchemaFile {
                    field: "card_number".to_string(),
                    sfi: 1,
                    offset: 0,
                    length: 8,
                    encoding: FieldEncoding::Hex,
                },
                SchemaFile {
                    field: "holder".to_string(),
                    sfi: 2,
                    offset: 0,
                    length: 16,
                    encoding: FieldEncoding::Ascii,
                },
            ],
        }
    }
}

impl CardSchema {
    fn resolve(&self) -> Result<ResolvedSchema> {
        let field = format!("sessions.card_schemas[{}].aid", self.name);
        let aid = aid(&field, &self.aid)?;
        if self.files.is_empty() {
            return Err(Error::config(format!(
                "card schema {:?} lists no files",
                self.name
            )));
        }
        for file in &self.files {
            if !(1..=30).contains(&file.sfi) {
                return Err(Error::config(format!(
                    "card schema {:?}: sfi {} of {:?} is outside 1-30",
                    self.name, file.sfi, file.field
                )));
            }
            if file.length == 0 {
                return Err(Error::config(format!(
                    "card schema {:?}: {:?} has zero length",
                    self.name, file.field
                )));
            }
        }
        Ok(ResolvedSchema {
            name: self.name.clone(),
            aid,
            files: self.files.clone(),
        })
    }
}

/// A validated card schema with its AID decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchema {
    pub name: String,
    pub aid: Vec<u8>,
    pub files: Vec<SchemaFile>,
}

/// Validated configuration used by the runtime and the sessions.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub timing: TimingConfig,
    pub sam: SamSettings,
    pub sessions: SessionConfig,
    pub schemas: Vec<ResolvedSchema>,
}

impl ReaderSettings {
    pub fn schema(&self, name: &str) -> Option<&ResolvedSchema> {
        self.schemas.iter().find(|s| s.name == name)
    }
}
