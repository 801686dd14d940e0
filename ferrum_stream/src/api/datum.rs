use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost_types::Timestamp;

use crate::framework::errors::FerrumStreamError;
use crate::proto;

/// Tag understood by the pipeline as "discard this message".
pub const DROP: &str = "U+005C__DROP__";

/// Delivery bookkeeping attached to every datum by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Unique per logical item, shared by all of its redeliveries.
    pub id: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub num_delivered: u64,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            num_delivered: 1,
        }
    }
}

/// Inbound item handed to the map and reduce hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    /// Ordered keys, the partition identity of the datum.
    pub keys: Vec<String>,
    pub value: Bytes,
    /// Time of the element as seen at source.
    pub event_time: DateTime<Utc>,
    /// Guarantee that no element older than this time is still undelivered.
    pub watermark: DateTime<Utc>,
    pub metadata: Metadata,
}

impl Datum {
    pub fn new(keys: Vec<String>, value: impl Into<Bytes>) -> Self {
        Self {
            keys,
            value: value.into(),
            event_time: DateTime::<Utc>::default(),
            watermark: DateTime::<Utc>::default(),
            metadata: Metadata::default(),
        }
    }

    pub fn event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn watermark(mut self, watermark: DateTime<Utc>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn delivery(mut self, id: impl Into<String>, num_delivered: u64) -> Self {
        self.metadata = Metadata {
            id: id.into(),
            num_delivered,
        };
        self
    }
}

/// Message is the response from the user's map and reduce hooks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Passed on to the next vertex as is, may be empty.
    pub keys: Vec<String>,
    pub value: Bytes,
    /// Used by the pipeline for conditional forwarding, never interpreted here.
    pub tags: Vec<String>,
}

impl Message {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            keys: Vec::new(),
            value: value.into(),
            tags: Vec::new(),
        }
    }

    /// A message with an empty value and the drop tag.
    ///
    /// ```
    /// use ferrum_stream::api::datum::{Message, DROP};
    /// let dropped = Message::message_to_drop();
    /// assert_eq!(dropped.tags, vec![DROP.to_string()]);
    /// ```
    pub fn message_to_drop() -> Self {
        Self {
            keys: Vec::new(),
            value: Bytes::new(),
            tags: vec![DROP.to_string()],
        }
    }

    pub fn keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }
}

/// Missing timestamps are read as the unix epoch.
fn utc_from_timestamp(
    field: &str,
    timestamp: Option<Timestamp>,
) -> Result<DateTime<Utc>, FerrumStreamError> {
    match timestamp {
        None => Ok(DateTime::<Utc>::default()),
        Some(ts) => {
            let nanos = u32::try_from(ts.nanos).map_err(|_| {
                FerrumStreamError::InvalidDatum(format!("{} has negative nanos", field))
            })?;
            DateTime::<Utc>::from_timestamp(ts.seconds, nanos).ok_or_else(|| {
                FerrumStreamError::InvalidDatum(format!("{} is out of range", field))
            })
        }
    }
}

impl TryFrom<proto::Datum> for Datum {
    type Error = FerrumStreamError;

    fn try_from(datum: proto::Datum) -> Result<Self, Self::Error> {
        let event_time = utc_from_timestamp(
            "event_time",
            datum.event_time.and_then(|et| et.event_time),
        )?;
        let watermark =
            utc_from_timestamp("watermark", datum.watermark.and_then(|wm| wm.watermark))?;
        let metadata = datum
            .metadata
            .map(|md| Metadata {
                id: md.id,
                num_delivered: md.num_delivered,
            })
            .unwrap_or_default();

        Ok(Datum {
            keys: datum.keys,
            value: Bytes::from(datum.value),
            event_time,
            watermark,
            metadata,
        })
    }
}

impl From<Message> for proto::ResponseDatum {
    fn from(message: Message) -> Self {
        proto::ResponseDatum {
            keys: message.keys,
            value: message.value.to_vec(),
            tags: message.tags,
        }
    }
}

pub(crate) fn prost_timestamp_from_utc(t: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

impl From<Datum> for proto::Datum {
    fn from(datum: Datum) -> Self {
        proto::Datum {
            keys: datum.keys,
            value: datum.value.to_vec(),
            event_time: Some(proto::EventTime {
                event_time: Some(prost_timestamp_from_utc(datum.event_time)),
            }),
            watermark: Some(proto::Watermark {
                watermark: Some(prost_timestamp_from_utc(datum.watermark)),
            }),
            metadata: Some(proto::Metadata {
                id: datum.metadata.id,
                num_delivered: datum.metadata.num_delivered,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn missing_fields_take_defaults() {
        let datum = Datum::try_from(proto::Datum {
            keys: vec!["a".to_string()],
            value: b"x".to_vec(),
            event_time: None,
            watermark: Some(proto::Watermark { watermark: None }),
            metadata: None,
        })
        .unwrap();

        assert_eq!(datum.keys, vec!["a".to_string()]);
        assert_eq!(datum.value, Bytes::from_static(b"x"));
        assert_eq!(datum.event_time, DateTime::<Utc>::default());
        assert_eq!(datum.watermark, DateTime::<Utc>::default());
        assert_eq!(datum.metadata, Metadata::default());
    }

    #[test]
    fn timestamps_and_metadata_are_carried_over() {
        let datum = Datum::try_from(proto::Datum {
            keys: vec![],
            value: vec![],
            event_time: Some(proto::EventTime {
                event_time: Some(Timestamp {
                    seconds: 60,
                    nanos: 5,
                }),
            }),
            watermark: Some(proto::Watermark {
                watermark: Some(Timestamp {
                    seconds: 120,
                    nanos: 0,
                }),
            }),
            metadata: Some(proto::Metadata {
                id: "m1".to_string(),
                num_delivered: 3,
            }),
        })
        .unwrap();

        assert_eq!(datum.event_time.timestamp(), 60);
        assert_eq!(datum.event_time.timestamp_subsec_nanos(), 5);
        assert_eq!(datum.watermark.timestamp(), 120);
        assert_eq!(datum.metadata.id, "m1");
        assert_eq!(datum.metadata.num_delivered, 3);
    }

    #[test]
    fn negative_nanos_are_rejected() {
        let result = Datum::try_from(proto::Datum {
            keys: vec![],
            value: vec![],
            event_time: Some(proto::EventTime {
                event_time: Some(Timestamp {
                    seconds: 1,
                    nanos: -1,
                }),
            }),
            watermark: None,
            metadata: None,
        });
        assert_err!(result);
    }

    #[test]
    fn message_keeps_keys_and_tags_on_the_wire() {
        let response = proto::ResponseDatum::from(
            Message::new("6")
                .keys(vec!["k".to_string()])
                .tags(vec!["even".to_string()]),
        );
        assert_eq!(response.keys, vec!["k".to_string()]);
        assert_eq!(response.value, b"6".to_vec());
        assert_eq!(response.tags, vec!["even".to_string()]);
    }
}
