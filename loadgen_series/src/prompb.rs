//! Prometheus remote write protobuf messages.
//!
//! Only the subset of `prometheus/prompb/{remote,types}.proto` that a writer
//! needs is mirrored here: a request carries time series, a time series
//! carries labels and samples. Field tags match upstream so the encoding is
//! accepted by any remote write receiver.

#![allow(missing_docs)]

/// A batch of series pushed in one remote write request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// A single labelled series and its samples.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeSeries {
    /// Labels, sorted by name then value.
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the unix epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl Label {
    /// Create a new [`Label`]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl TimeSeries {
    /// Return the value of the label called `name`, if present.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn write_request_decodes_what_it_encodes() {
        let request = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![
                    Label::new("__name__", "cortex_load_generator_sine_wave"),
                    Label::new("wave", "1"),
                ],
                samples: vec![Sample {
                    value: 0.5,
                    timestamp: 1_687_996_800_000,
                }],
            }],
        };

        let bytes = request.encode_to_vec();
        let decoded = WriteRequest::decode(bytes.as_slice()).expect("valid protobuf");
        assert_eq!(request, decoded);
        assert_eq!(decoded.timeseries[0].label("wave"), Some("1"));
        assert_eq!(decoded.timeseries[0].label("churn"), None);
    }

    #[test]
    fn label_is_encoded_with_upstream_field_tags() {
        // field 1, wire type 2, length 1, "a"; field 2, wire type 2, length 1, "b"
        let bytes = Label::new("a", "b").encode_to_vec();
        assert_eq!(bytes, vec![0x0a, 0x01, b'a', 0x12, 0x01, b'b']);
    }
}
