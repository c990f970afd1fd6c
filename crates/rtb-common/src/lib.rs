use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Event Types
// ============================================================================

/// Identifying fields shared by every auction notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    pub bid_id: String,
    pub campaign_id: u64,
    pub creative_id: u64,
    pub timestamp_bucket: i64,
    pub exchange_id: String,
}

/// A win, impression, or click notification received from the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Win { context: EventContext, win_price: f64 },
    Impression(EventContext),
    Click(EventContext),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Win,
    Impression,
    Click,
}

impl EventKind {
    /// Topic used both as the store partition and the bus routing key.
    pub fn topic(self) -> &'static str {
        match self {
            EventKind::Win => "wins",
            EventKind::Impression => "impressions",
            EventKind::Click => "clicks",
        }
    }

    /// Name of the stats counter bumped once per recorded event.
    pub fn counter_name(self) -> String {
        format!("{}.total", self.topic())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Win { .. } => EventKind::Win,
            Event::Impression(_) => EventKind::Impression,
            Event::Click(_) => EventKind::Click,
        }
    }

    pub fn context(&self) -> &EventContext {
        match self {
            Event::Win { context, .. } => context,
            Event::Impression(context) | Event::Click(context) => context,
        }
    }

    /// Flatten the event into the record written to the store and the bus.
    pub fn to_record(&self) -> EventRecord {
        let context = self.context();
        let win_price = match self {
            Event::Win { win_price, .. } => Some(*win_price),
            _ => None,
        };

        EventRecord {
            bid_id: context.bid_id.clone(),
            campaign_id: context.campaign_id,
            creative_id: context.creative_id,
            exchange_id: context.exchange_id.clone(),
            win_price,
            timestamp_bucket: context.timestamp_bucket,
        }
    }
}

/// Normalized, flat form of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub bid_id: String,
    pub campaign_id: u64,
    pub creative_id: u64,
    pub exchange_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_price: Option<f64>,
    pub timestamp_bucket: i64,
}

// ============================================================================
// Event Options
// ============================================================================

/// Per-call options.
///
/// `test` suppresses every side-effecting emission (stats, store, bus) while
/// still computing the same decision, which lets callers dry-run validate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOptions {
    pub test: bool,
    pub click_tag: Option<String>,
}

/// A single recognized option. Folding a list of these yields [`EventOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOption {
    Test(bool),
    ClickTag(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("Unrecognized event option: {0}")]
    Unrecognized(String),

    #[error("Invalid value for option {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl FromIterator<EventOption> for EventOptions {
    fn from_iter<I: IntoIterator<Item = EventOption>>(iter: I) -> Self {
        iter.into_iter().fold(EventOptions::default(), |mut options, option| {
            match option {
                EventOption::Test(test) => options.test = test,
                EventOption::ClickTag(tag) => options.click_tag = Some(tag),
            }
            options
        })
    }
}

impl EventOptions {
    pub fn test_mode() -> Self {
        Self {
            test: true,
            click_tag: None,
        }
    }

    pub fn with_click_tag(mut self, click_tag: impl Into<String>) -> Self {
        self.click_tag = Some(click_tag.into());
        self
    }

    /// Parse untyped key/value pairs (e.g. query parameters).
    ///
    /// Only `test` and `clicktag` are recognized; any other key is rejected.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, OptionError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut parsed = Vec::new();
        for (key, value) in pairs {
            let option = match key {
                "test" => match value {
                    "true" | "1" => EventOption::Test(true),
                    "false" | "0" => EventOption::Test(false),
                    _ => {
                        return Err(OptionError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                },
                "clicktag" => EventOption::ClickTag(value.to_string()),
                other => return Err(OptionError::Unrecognized(other.to_string())),
            };
            parsed.push(option);
        }
        Ok(parsed.into_iter().collect())
    }
}

// ============================================================================
// Creative Types
// ============================================================================

/// Rendering class of a creative. Unrecognized tags are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CreativeClass {
    Html5,
    Banner,
    Unknown(String),
}

impl From<String> for CreativeClass {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "html5" => CreativeClass::Html5,
            "banner" => CreativeClass::Banner,
            _ => CreativeClass::Unknown(tag),
        }
    }
}

impl From<CreativeClass> for String {
    fn from(class: CreativeClass) -> Self {
        match class {
            CreativeClass::Html5 => "html5".to_string(),
            CreativeClass::Banner => "banner".to_string(),
            CreativeClass::Unknown(tag) => tag,
        }
    }
}

/// Creative attributes as loaded from campaign configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreativeRecord {
    pub campaign_id: u64,
    pub creative_id: u64,
    pub class: CreativeClass,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Click-through redirect target
    #[serde(default)]
    pub ctr_url: Option<String>,
    #[serde(default)]
    pub iframe_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

// ============================================================================
// Decisions
// ============================================================================

/// Ad-serving answer returned to the caller of a log operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Decision {
    /// Win acknowledged
    Successful,
    /// HTML5 markup with the click tag appended
    Html(String),
    /// Static banner asset path
    AssetPath(String),
    /// Click-through URL
    Redirect(String),
    /// Nothing to render; the creative was missing or malformed
    NoContent,
}

// ============================================================================
// Messaging Configuration Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub name: String,
    pub exchange: String,
    pub topic: String,
    pub pool_size: usize,
}
