//! Channel payloads.
//!
//! A detector reports one [`DetectorPayload`] per grab. Each payload holds an ordered list
//! of [`Channel`]s, and each channel carries scalar, 1-D or 2-D data, optionally with axis
//! metadata describing its intrinsic dimensions.

use serde::{Deserialize, Serialize};

/// Dimensionality and samples of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelData {
    /// A single value.
    Scalar {
        /// The value.
        value: f64,
    },
    /// A 1-D trace.
    Trace {
        /// Samples, in order.
        samples: Vec<f64>,
    },
    /// A 2-D image, row-major.
    Image {
        /// Number of columns.
        width: usize,
        /// Number of rows.
        height: usize,
        /// `height * width` pixels, row-major.
        pixels: Vec<f64>,
    },
}

impl ChannelData {
    /// Intrinsic dimensionality (0, 1 or 2).
    pub fn ndim(&self) -> usize {
        match self {
            ChannelData::Scalar { .. } => 0,
            ChannelData::Trace { .. } => 1,
            ChannelData::Image { .. } => 2,
        }
    }

    /// Intrinsic shape, row-major. Empty for scalars.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ChannelData::Scalar { .. } => Vec::new(),
            ChannelData::Trace { samples } => vec![samples.len()],
            ChannelData::Image { width, height, .. } => vec![*height, *width],
        }
    }

    /// All samples as a flat row-major slice.
    pub fn as_slice(&self) -> &[f64] {
        match self {
            ChannelData::Scalar { value } => std::slice::from_ref(value),
            ChannelData::Trace { samples } => samples,
            ChannelData::Image { pixels, .. } => pixels,
        }
    }

    /// Scalar value, if this is a scalar channel.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ChannelData::Scalar { value } => Some(*value),
            _ => None,
        }
    }

    /// Name of the storage group holding channels of this dimensionality.
    pub fn data_type(&self) -> &'static str {
        match self {
            ChannelData::Scalar { .. } => "Data0D",
            ChannelData::Trace { .. } => "Data1D",
            ChannelData::Image { .. } => "Data2D",
        }
    }

    /// True when the sample count matches the declared shape.
    pub fn is_consistent(&self) -> bool {
        match self {
            ChannelData::Image {
                width,
                height,
                pixels,
            } => width.checked_mul(*height) == Some(pixels.len()),
            _ => true,
        }
    }
}

/// Metadata of one intrinsic dimension of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAxis {
    /// Axis label, e.g. `"wavelength"`.
    pub label: String,
    /// Physical units, e.g. `"nm"`.
    pub units: String,
    /// Intrinsic dimension this axis describes (0 for traces, 0 or 1 for images).
    pub index: usize,
    /// Coordinate of every sample along the dimension.
    pub data: Vec<f64>,
}

/// One named data stream from a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel name, unique within its detector.
    pub name: String,
    /// Samples.
    pub data: ChannelData,
    /// Optional axis metadata.
    #[serde(default)]
    pub axes: Vec<ChannelAxis>,
}

impl Channel {
    /// Scalar channel.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            data: ChannelData::Scalar { value },
            axes: Vec::new(),
        }
    }

    /// 1-D channel.
    pub fn trace(name: impl Into<String>, samples: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ChannelData::Trace { samples },
            axes: Vec::new(),
        }
    }

    /// 2-D channel with row-major pixels.
    pub fn image(name: impl Into<String>, width: usize, height: usize, pixels: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ChannelData::Image {
                width,
                height,
                pixels,
            },
            axes: Vec::new(),
        }
    }

    /// Attach axis metadata.
    pub fn with_axis(mut self, axis: ChannelAxis) -> Self {
        self.axes.push(axis);
        self
    }
}

/// Everything one detector reported for one grab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorPayload {
    /// Name of the reporting detector.
    pub detector: String,
    /// Channels, in the order the detector produced them.
    pub channels: Vec<Channel>,
}

impl DetectorPayload {
    /// Payload with the given channels.
    pub fn new(detector: impl Into<String>, channels: Vec<Channel>) -> Self {
        Self {
            detector: detector.into(),
            channels,
        }
    }

    /// Channel called `name`, if present.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes_and_groups() {
        let scalar = Channel::scalar("power", 1.5);
        assert_eq!(scalar.data.ndim(), 0);
        assert!(scalar.data.shape().is_empty());
        assert_eq!(scalar.data.as_slice(), &[1.5]);
        assert_eq!(scalar.data.data_type(), "Data0D");

        let image = Channel::image("frame", 3, 2, vec![0.0; 6]);
        assert_eq!(image.data.shape(), vec![2, 3]);
        assert_eq!(image.data.data_type(), "Data2D");
        assert!(image.data.is_consistent());
        assert!(!Channel::image("bad", 3, 2, vec![0.0; 5]).data.is_consistent());
    }

    #[test]
    fn test_payload_lookup() {
        let payload = DetectorPayload::new(
            "spectrometer",
            vec![
                Channel::trace("spectrum", vec![1.0, 2.0]),
                Channel::scalar("integral", 3.0),
            ],
        );
        assert_eq!(payload.channel("integral").and_then(|c| c.data.as_scalar()), Some(3.0));
        assert!(payload.channel("missing").is_none());
    }
}
