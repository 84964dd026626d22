use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Tags carried by outbound responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseTag {
    CameraProperties,
    SensorEventsStarted,
    SensorEvents,
    AfResult,
    AeResult,
    AwbResult,
    ThreeADone,
    VibrationStarted,
    CaptureResults,
    JpegImage,
    YuvImage,
    Raw10Image,
    RawImage,
    DngImage,
}

impl ResponseTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseTag::CameraProperties => "cameraProperties",
            ResponseTag::SensorEventsStarted => "sensorEventsStarted",
            ResponseTag::SensorEvents => "sensorEvents",
            ResponseTag::AfResult => "afResult",
            ResponseTag::AeResult => "aeResult",
            ResponseTag::AwbResult => "awbResult",
            ResponseTag::ThreeADone => "3aDone",
            ResponseTag::VibrationStarted => "vibrationStarted",
            ResponseTag::CaptureResults => "captureResults",
            ResponseTag::JpegImage => "jpegImage",
            ResponseTag::YuvImage => "yuvImage",
            ResponseTag::Raw10Image => "raw10Image",
            ResponseTag::RawImage => "rawImage",
            ResponseTag::DngImage => "dngImage",
        }
    }

    /// Whether responses with this tag are followed by image bytes
    pub fn carries_image(&self) -> bool {
        matches!(
            self,
            ResponseTag::JpegImage
                | ResponseTag::YuvImage
                | ResponseTag::Raw10Image
                | ResponseTag::RawImage
                | ResponseTag::DngImage
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Header<'a> {
    tag: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    str_value: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    obj_value: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buf_value_size: Option<usize>,
}

/// One outbound message, optionally followed by a binary payload
#[derive(Debug, Clone)]
pub struct Response {
    pub tag: ResponseTag,
    pub str_value: Option<String>,
    pub obj_value: Option<Value>,
    pub payload: Option<Bytes>,
}

impl Response {
    pub fn text(tag: ResponseTag, value: impl Into<String>) -> Self {
        Self {
            tag,
            str_value: Some(value.into()),
            obj_value: None,
            payload: None,
        }
    }

    pub fn object(tag: ResponseTag, value: Value) -> Self {
        Self {
            tag,
            str_value: None,
            obj_value: Some(value),
            payload: None,
        }
    }

    pub fn buffer(tag: ResponseTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            str_value: None,
            obj_value: None,
            payload: Some(payload.into()),
        }
    }

    pub fn with_object(mut self, value: Value) -> Self {
        self.obj_value = Some(value);
        self
    }

    /// Serialized header line, terminated by `\n`. Carries `bufValueSize`
    /// exactly when a payload follows.
    pub fn encode_header(&self) -> Result<Vec<u8>> {
        let header = Header {
            tag: self.tag.as_str(),
            str_value: self.str_value.as_deref(),
            obj_value: self.obj_value.as_ref(),
            buf_value_size: self.payload.as_ref().map(Bytes::len),
        };
        let mut line = serde_json::to_vec(&header)?;
        line.push(b'\n');
        Ok(line)
    }
}
