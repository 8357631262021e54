use serde::{Deserialize, Serialize};

pub const MSGTYPE_TEXT: &str = "m.text";
pub const MSGTYPE_IMAGE: &str = "m.image";
pub const FORMAT_HTML: &str = "org.matrix.custom.html";

/// Content of an `m.room.message` event. Empty optional fields are left out
/// of the JSON entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
    pub msgtype: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub formatted_body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            msgtype: MSGTYPE_TEXT.to_string(),
            ..Default::default()
        }
    }

    pub fn html(body: impl Into<String>, formatted_body: impl Into<String>) -> Self {
        Self {
            formatted_body: formatted_body.into(),
            format: FORMAT_HTML.to_string(),
            ..Self::text(body)
        }
    }

    pub fn image(body: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            msgtype: MSGTYPE_IMAGE.to_string(),
            url: url.into(),
            ..Default::default()
        }
    }
}
