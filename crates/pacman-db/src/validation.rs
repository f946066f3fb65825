//! Pure checks applied to client submissions before anything touches storage.
//!
//! Fields arrive as loosely typed JSON (`"score": "1200"` and `"score": 1200`
//! are both accepted), so the submission structs keep raw [`Value`]s and the
//! validators decide what is usable.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! * highscores: presence of `name`, `score`, `level`, then `name`, `score`,
//!   `level`;
//! * session stats: presence of `userId`, its format, then `score`, `level`,
//!   `lives`, `elapsedTime`.
//!
//! A field is present unless it is absent, `null` or an empty string. Numeric
//! zero counts as present.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    error::{Field, ValidationFailure},
    sessions::{SessionId, SessionStats},
    CloudMetadata,
};

pub const NAME_MAX_CHARS: usize = 50;
pub const CLOUD_MAX_CHARS: usize = 100;
pub const ZONE_MAX_CHARS: usize = 100;
pub const HOST_MAX_CHARS: usize = 255;

pub const SCORE_RANGE: (i64, i64) = (0, 99_999_999);
pub const LEVEL_RANGE: (i64, i64) = (1, 999);
pub const LIVES_RANGE: (i64, i64) = (0, 99);
pub const ELAPSED_TIME_RANGE: (i64, i64) = (0, 86_400);

/// Placeholder stored for metadata the client omitted or mangled.
pub const UNKNOWN: &str = "unknown";

static EMBEDDED_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>").unwrap()
});
static MARKUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Raw body of `POST /highscores`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct HighscoreSubmission {
    #[schema(value_type = Option<String>, example = "Ann")]
    pub name: Option<Value>,
    #[schema(value_type = Option<i64>, example = 12400)]
    pub score: Option<Value>,
    #[schema(value_type = Option<i64>, example = 3)]
    pub level: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub cloud: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub zone: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub host: Option<Value>,
}

/// Raw body of `POST /user/stats`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsSubmission {
    #[schema(value_type = Option<String>)]
    pub user_id: Option<Value>,
    #[schema(value_type = Option<i64>)]
    pub score: Option<Value>,
    #[schema(value_type = Option<i64>)]
    pub level: Option<Value>,
    #[schema(value_type = Option<i64>)]
    pub lives: Option<Value>,
    #[schema(value_type = Option<i64>)]
    pub elapsed_time: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub cloud: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub zone: Option<Value>,
    #[schema(value_type = Option<String>)]
    pub host: Option<Value>,
}

/// A highscore that passed validation and is ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighscoreEntry {
    pub name: String,
    pub score: i64,
    pub level: i64,
    pub metadata: CloudMetadata,
}

/// Strips tag-like markup, trims and truncates to `max_len` characters.
///
/// `<script>`/`<style>` elements are dropped together with their body, any
/// other `<...>` tag is removed on its own. This is defense in depth for stored
/// display strings, not an HTML sanitizer. The result is stable: sanitizing it
/// again returns it unchanged.
pub fn sanitize_str(input: &str, max_len: usize) -> String {
    let without_code = EMBEDDED_CODE_RE.replace_all(input, "");
    let stripped = MARKUP_RE.replace_all(&without_code, "");
    let truncated: String = stripped.trim().chars().take(max_len).collect();
    truncated.trim_end().to_string()
}

/// [`sanitize_str`] for loosely typed input; anything but a JSON string is empty.
pub fn sanitize_text(value: Option<&Value>, max_len: usize) -> String {
    match value {
        Some(Value::String(text)) => sanitize_str(text, max_len),
        _ => String::new(),
    }
}

/// Parses a base-10 integer and checks it against `min..=max`.
///
/// Strings are read up to the first non-digit (`"12abc"` is 12) and fractional
/// numbers are truncated toward zero.
pub fn parse_bounded_int(value: Option<&Value>, min: i64, max: i64) -> Option<i64> {
    let parsed = match value? {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite())
                .map(|float| float.trunc() as i64)
        }),
        Value::String(text) => parse_leading_int(text),
        _ => None,
    }?;

    (min..=max).contains(&parsed).then_some(parsed)
}

fn parse_leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let magnitude = digits[..end].parse::<i64>().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Sanitizes optional metadata, falling back to [`UNKNOWN`]. Never fails.
pub fn sanitize_metadata(cloud: Option<&Value>, zone: Option<&Value>, host: Option<&Value>) -> CloudMetadata {
    let or_unknown = |value: Option<&Value>, max_len: usize| {
        let cleaned = sanitize_text(value, max_len);
        if cleaned.is_empty() {
            UNKNOWN.to_string()
        } else {
            cleaned
        }
    };

    CloudMetadata {
        cloud: or_unknown(cloud, CLOUD_MAX_CHARS),
        zone: or_unknown(zone, ZONE_MAX_CHARS),
        host: or_unknown(host, HOST_MAX_CHARS),
    }
}

fn is_present(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.is_empty(),
        Some(_) => true,
    }
}

fn bounded(value: &Option<Value>, field: Field, range: (i64, i64), message: &str) -> Result<i64, ValidationFailure> {
    parse_bounded_int(value.as_ref(), range.0, range.1)
        .ok_or_else(|| ValidationFailure::new(field, message))
}

fn score(value: &Option<Value>) -> Result<i64, ValidationFailure> {
    bounded(
        value,
        Field::Score,
        SCORE_RANGE,
        "Score must be a valid number between 0 and 99999999",
    )
}

fn level(value: &Option<Value>) -> Result<i64, ValidationFailure> {
    bounded(
        value,
        Field::Level,
        LEVEL_RANGE,
        "Level must be a valid number between 1 and 999",
    )
}

/// Validates a highscore submission.
pub fn validate_highscore(submission: &HighscoreSubmission) -> Result<HighscoreEntry, ValidationFailure> {
    let required = [
        (Field::Name, &submission.name),
        (Field::Score, &submission.score),
        (Field::Level, &submission.level),
    ];
    if let Some((field, _)) = required.iter().find(|(_, value)| !is_present(value)) {
        return Err(ValidationFailure::new(
            *field,
            "Missing required fields: name, score, and level are required",
        ));
    }

    let name = sanitize_text(submission.name.as_ref(), NAME_MAX_CHARS);
    if name.is_empty() {
        return Err(ValidationFailure::new(
            Field::Name,
            "Name must be between 1 and 50 characters",
        ));
    }

    let score = score(&submission.score)?;
    let level = level(&submission.level)?;

    Ok(HighscoreEntry {
        name,
        score,
        level,
        metadata: sanitize_metadata(
            submission.cloud.as_ref(),
            submission.zone.as_ref(),
            submission.host.as_ref(),
        ),
    })
}

/// Validates a session stats submission, returning the session to update and
/// the replacement field values.
pub fn validate_stats(submission: &StatsSubmission) -> Result<(SessionId, SessionStats), ValidationFailure> {
    if !is_present(&submission.user_id) {
        return Err(ValidationFailure::new(
            Field::UserId,
            "Missing required field: userId",
        ));
    }

    let session_id = match &submission.user_id {
        Some(Value::String(raw)) => raw.parse::<SessionId>().ok(),
        _ => None,
    }
    .ok_or_else(|| ValidationFailure::new(Field::UserId, "Invalid userId format"))?;

    let score = score(&submission.score)?;
    let level = level(&submission.level)?;
    let lives = bounded(
        &submission.lives,
        Field::Lives,
        LIVES_RANGE,
        "Lives must be a valid number between 0 and 99",
    )?;
    let elapsed_time = bounded(
        &submission.elapsed_time,
        Field::ElapsedTime,
        ELAPSED_TIME_RANGE,
        "Elapsed time must be a valid number between 0 and 86400 seconds",
    )?;

    Ok((
        session_id,
        SessionStats {
            score,
            level,
            lives,
            elapsed_time,
            metadata: sanitize_metadata(
                submission.cloud.as_ref(),
                submission.zone.as_ref(),
                submission.host.as_ref(),
            ),
        },
    ))
}
