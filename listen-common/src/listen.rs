use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Minimum width of the zero-padded `listened_at` prefix written in front of each dump line.
/// Wider timestamps are written in full.
pub const SORT_KEY_WIDTH: usize = 12;
/// Separator between the sort key and the JSON payload.
pub const SORT_KEY_SEPARATOR: u8 = b'-';
/// Marker left in `additional_info` by a previous deduplication pass.
pub const DEDUP_TAG: &str = "dedup_tag";

/// Enumeration of errors raised while decoding a single dump line.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line is empty")]
    EmptyLine,
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    #[error("listen is missing required field {0}")]
    MissingField(&'static str),
    #[error("failed to parse listen: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listened_at {listened_at} is below the minimum valid timestamp {minimum}")]
    TimestampTooOld { listened_at: i64, minimum: i64 },
}

/// Free-form metadata attached to a listen. Only the names are typed; every other
/// key is carried as-is into the stored payload.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct TrackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Expected to be an object, but dumps contain anything here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One play of one track by one user.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Listen {
    pub listened_at: i64,
    pub recording_id: String,
    pub user_name: String,
    pub track_metadata: TrackMetadata,
}

/// Wire shape of a dump record. Required fields are checked after deserializing so a
/// missing one is reported by name.
#[derive(Deserialize)]
struct RawListen {
    listened_at: Option<i64>,
    #[serde(alias = "recording_msid")]
    recording_id: Option<String>,
    user_name: Option<String>,
    track_metadata: Option<TrackMetadata>,
}

impl TryFrom<RawListen> for Listen {
    type Error = ParseError;

    fn try_from(raw: RawListen) -> Result<Self, Self::Error> {
        Ok(Listen {
            listened_at: raw
                .listened_at
                .ok_or(ParseError::MissingField("listened_at"))?,
            recording_id: raw
                .recording_id
                .ok_or(ParseError::MissingField("recording_id"))?,
            user_name: raw.user_name.ok_or(ParseError::MissingField("user_name"))?,
            track_metadata: raw
                .track_metadata
                .ok_or(ParseError::MissingField("track_metadata"))?,
        })
    }
}

/// Decode one dump line, with or without its sort key prefix.
pub fn decode_line(line: &str) -> Result<Listen, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return Err(ParseError::EmptyLine);
    }

    let raw: RawListen = serde_json::from_str(strip_sort_key(line))?;
    Listen::try_from(raw)
}

/// Encode a listen in the sorted dump format: `%012d-{json}`.
pub fn encode_line(listen: &Listen) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_string(listen)?;
    Ok(format!(
        "{:0width$}{}{}",
        listen.listened_at,
        SORT_KEY_SEPARATOR as char,
        payload,
        width = SORT_KEY_WIDTH
    ))
}

/// Drop a leading `[-]digits-` sort key. Its width follows the timestamp, so only the
/// shape is checked.
fn strip_sort_key(line: &str) -> &str {
    let bytes = line.as_bytes();
    let sign = usize::from(bytes.first() == Some(&b'-'));
    let digits = bytes[sign..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits > 0 && bytes.get(sign + digits) == Some(&SORT_KEY_SEPARATOR) {
        &line[sign + digits + 1..]
    } else {
        line
    }
}

/// Truthiness as the dumps were written with it: null, false, zero and empty values are
/// all considered unset.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

impl Listen {
    /// Strip null characters from the names and drop unset keys. Everything downstream,
    /// duplicate detection included, must only ever see a sanitized listen.
    pub fn sanitize(&mut self) {
        let metadata = &mut self.track_metadata;

        for name in [
            &mut metadata.artist_name,
            &mut metadata.track_name,
            &mut metadata.release_name,
        ] {
            if let Some(value) = name.as_mut() {
                value.retain(|c| c != '\u{0}');
            }
            if name.as_deref().map_or(false, str::is_empty) {
                *name = None;
            }
        }

        metadata.extra.retain(|_, value| is_truthy(value));

        if let Some(Value::Object(info)) = metadata.additional_info.as_mut() {
            info.retain(|_, value| is_truthy(value));
        }
        if !metadata.additional_info.as_ref().map_or(false, is_truthy) {
            metadata.additional_info = None;
        }
    }

    pub fn validate(&self, minimum: i64) -> Result<(), ValidationError> {
        if self.listened_at < minimum {
            return Err(ValidationError::TimestampTooOld {
                listened_at: self.listened_at,
                minimum,
            });
        }
        Ok(())
    }

    /// The natural key the store enforces uniqueness on.
    pub fn key(&self) -> (i64, &str, &str) {
        (self.listened_at, &self.recording_id, &self.user_name)
    }

    pub fn is_dedup_tagged(&self) -> bool {
        self.track_metadata
            .additional_info
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|info| info.get(DEDUP_TAG))
            .map_or(false, is_truthy)
    }

    /// How much metadata this listen carries, used to keep the richer of two duplicates.
    pub fn populated_field_count(&self) -> usize {
        let metadata = &self.track_metadata;
        let names = [
            &metadata.artist_name,
            &metadata.track_name,
            &metadata.release_name,
        ]
        .into_iter()
        .filter(|name| name.as_deref().map_or(false, |n| !n.is_empty()))
        .count();

        let additional = match &metadata.additional_info {
            Some(Value::Object(info)) => info.values().filter(|v| is_truthy(v)).count(),
            Some(other) if is_truthy(other) => 1,
            _ => 0,
        };

        names + metadata.extra.values().filter(|v| is_truthy(v)).count() + additional
    }

    /// Both track names present and equal, ignoring case.
    pub fn same_track_name(&self, other: &Listen) -> bool {
        match (
            self.track_metadata.track_name.as_deref(),
            other.track_metadata.track_name.as_deref(),
        ) {
            (Some(a), Some(b)) => a == b || a.to_lowercase() == b.to_lowercase(),
            _ => false,
        }
    }

    /// JSON text stored alongside the key columns.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.track_metadata)
    }
}
