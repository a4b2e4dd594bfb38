use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub audio: Option<Audio>,
    #[serde(default)]
    pub document: Option<Document>,
}

impl Message {
    /// Reusable file handle of the uploaded media, however the server
    /// chose to classify it.
    pub fn file_id(&self) -> Option<&str> {
        self.audio
            .as_ref()
            .map(|audio| audio.file_id.as_str())
            .or_else(|| {
                self.document
                    .as_ref()
                    .map(|document| document.file_id.as_str())
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Audio {
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
}

/// One item of an outgoing media group. Only the group's last item
/// carries a caption; the platform lifts it onto the whole album.
#[derive(Debug, Serialize)]
pub struct InputMediaAudio<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    caption: &'a str,
    parse_mode: &'static str,
}

impl<'a> InputMediaAudio<'a> {
    pub fn new(file_id: &'a str, caption: &'a str) -> Self {
        Self {
            kind: "audio",
            media: file_id,
            caption,
            parse_mode: "HTML",
        }
    }
}

/// Upload destination, as configured.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    User,
    Chat,
    Channel,
}

impl Peer {
    /// Bot API chat id: users are plain, basic groups are negated, and
    /// channel ids carry the supergroup marker prefix.
    pub fn chat_id(&self) -> i64 {
        match self.kind {
            PeerKind::User => self.id,
            PeerKind::Chat => {
                if self.id < 0 {
                    self.id
                } else {
                    -self.id
                }
            }
            PeerKind::Channel => {
                if self.id < 0 {
                    self.id
                } else {
                    -(1_000_000_000_000 + self.id)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_chat_ids() {
        let user = Peer {
            kind: PeerKind::User,
            id: 12345,
        };
        assert_eq!(user.chat_id(), 12345);

        let chat = Peer {
            kind: PeerKind::Chat,
            id: 67890,
        };
        assert_eq!(chat.chat_id(), -67890);

        let channel = Peer {
            kind: PeerKind::Channel,
            id: 1234567890,
        };
        assert_eq!(channel.chat_id(), -1001234567890);
    }

    #[test]
    fn group_caption_is_omitted_when_empty() {
        let item = InputMediaAudio::new("file-id", "");
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("caption").is_none());

        let item = InputMediaAudio::new("file-id", "hello");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["caption"], "hello");
    }
}
