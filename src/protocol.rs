//! Control-channel message envelopes.
//!
//! Every frame on the WebSocket control channel is a tagged JSON envelope
//! `{type, payload}`. Frames are decoded once at the boundary into
//! [`ClientEnvelope`]; an unknown `type` is a single well-defined decode
//! error, never a partial dispatch.

use crate::peer::PeerSettings;
use serde::{Deserialize, Serialize};

/// Literal liveness probe, answered with [`PONG`] and bypassing JSON
/// framing entirely.
pub const PING: &str = "__PING__";

/// Reply to [`PING`].
pub const PONG: &str = "__PONG__";

/// A file announced by a peer in `register-files`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FileDeclaration {
    /// Display name of the file.
    pub name: String,
    /// Size in bytes, as declared by the uploader. Never verified against
    /// the bytes actually transferred.
    pub size: u64,
}

/// Settings patch; absent fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    /// Keep reusing one download token per file, or rotate after each use.
    pub reusable_download_keys: Option<bool>,
    /// Skip the reconnection grace period entirely.
    pub strict_session: Option<bool>,
    /// Permit ranged stream requests for this peer's files.
    pub allow_streaming: Option<bool>,
}

/// A `settings` payload. The optional `id` requests a `response` ack.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SettingsRequest {
    /// Correlation id for the ack, if the client wants one.
    #[serde(default)]
    pub id: Option<String>,
    /// The flags to apply.
    #[serde(flatten)]
    pub patch: SettingsPatch,
}

/// Messages received from a peer over the control channel.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// Start a fresh session; the server replies with `new-session`.
    CreateSession,
    /// Redeem a session key minted before a disconnect.
    RestoreSession {
        /// The session restoration key.
        key: String,
    },
    /// Announce hosted files.
    RegisterFiles(Vec<FileDeclaration>),
    /// Rotate the tokens of the listed files.
    RefreshFiles(Vec<String>),
    /// Rotate every file token this peer holds.
    RefreshAllFiles,
    /// Withdraw the listed files.
    RemoveFiles(Vec<String>),
    /// Cancel the listed download transfers.
    CancelRequests(Vec<String>),
    /// Cancel the listed stream transfers.
    CancelStreams(Vec<String>),
    /// Apply a settings patch.
    Settings(SettingsRequest),
    /// Nested envelopes, dispatched in order.
    Bulk(Vec<ClientEnvelope>),
}

/// Summary of a hosted file as sent to its owner.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileSummary {
    /// The file's current token.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// A rotated file token pair.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedFile {
    /// The previous token.
    pub id: String,
    /// The replacement token.
    pub new_id: String,
}

/// Messages pushed to a peer over the control channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEnvelope {
    /// A fresh session key.
    NewSession(String),
    /// Session restored: the replacement key plus current state.
    #[serde(rename_all = "camelCase")]
    RestoreSession {
        /// The replacement session key; the redeemed one is already dead.
        key: String,
        /// Current settings.
        settings: PeerSettings,
        /// Current file catalog.
        files: Vec<FileSummary>,
    },
    /// Tokens issued for newly registered (or rotated) files.
    RegisterFiles(Vec<FileSummary>),
    /// Rotated token pairs after a refresh.
    RefreshFiles(Vec<RefreshedFile>),
    /// A downloader is waiting: open an upload connection.
    #[serde(rename_all = "camelCase")]
    FileRequest {
        /// Transfer id to attach the upload to.
        download_id: String,
        /// Token of the requested file.
        file_id: String,
    },
    /// A stream requester is waiting: open an upload connection for the
    /// given byte range.
    #[serde(rename_all = "camelCase")]
    StreamRequest {
        /// The stream redirect key in use.
        stream_key: String,
        /// Transfer id to attach the upload to.
        stream_id: String,
        /// Token of the requested file.
        file_id: String,
        /// Inclusive byte range actually served.
        range: [u64; 2],
    },
    /// The downloader of this transfer is gone.
    DownloadCancelled(String),
    /// The requester of this stream is gone.
    StreamCancelled(String),
    /// This peer's IP exceeded its byte quota.
    #[serde(rename_all = "camelCase")]
    RateLimited {
        /// Milliseconds until the quota window resets.
        remaining_ms: u64,
    },
    /// Reply correlation for request/response-style client calls.
    Response {
        /// Correlation id from the request.
        id: String,
        /// Whether the request was applied.
        ok: bool,
        /// Optional response payload.
        data: Option<serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_pong_are_literals() {
        assert_eq!(PING, "__PING__");
        assert_eq!(PONG, "__PONG__");
    }

    #[test]
    fn decodes_create_session_without_payload() {
        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"create-session"}"#).unwrap();
        assert_eq!(env, ClientEnvelope::CreateSession);
    }

    #[test]
    fn decodes_create_session_with_null_payload() {
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"type":"create-session","payload":null}"#).unwrap();
        assert_eq!(env, ClientEnvelope::CreateSession);
    }

    #[test]
    fn decodes_restore_session() {
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"type":"restore-session","payload":{"key":"abc"}}"#).unwrap();
        assert_eq!(env, ClientEnvelope::RestoreSession { key: "abc".into() });
    }

    #[test]
    fn decodes_register_files() {
        let env: ClientEnvelope = serde_json::from_str(
            r#"{"type":"register-files","payload":[{"name":"a.txt","size":10}]}"#,
        )
        .unwrap();
        assert_eq!(
            env,
            ClientEnvelope::RegisterFiles(vec![FileDeclaration {
                name: "a.txt".into(),
                size: 10
            }])
        );
    }

    #[test]
    fn rejects_negative_file_size() {
        let result: Result<ClientEnvelope, _> = serde_json::from_str(
            r#"{"type":"register-files","payload":[{"name":"a.txt","size":-1}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn decodes_settings_with_correlation_id() {
        let env: ClientEnvelope = serde_json::from_str(
            r#"{"type":"settings","payload":{"id":"r1","strictSession":true}}"#,
        )
        .unwrap();
        match env {
            ClientEnvelope::Settings(req) => {
                assert_eq!(req.id.as_deref(), Some("r1"));
                assert_eq!(req.patch.strict_session, Some(true));
                assert_eq!(req.patch.allow_streaming, None);
            }
            other => panic!("expected settings, got {other:?}"),
        }
    }

    #[test]
    fn decodes_nested_bulk() {
        let env: ClientEnvelope = serde_json::from_str(
            r#"{"type":"bulk","payload":[
                {"type":"create-session"},
                {"type":"bulk","payload":[{"type":"refresh-all-files"}]}
            ]}"#,
        )
        .unwrap();
        match env {
            ClientEnvelope::Bulk(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0], ClientEnvelope::CreateSession);
                assert!(matches!(items[1], ClientEnvelope::Bulk(_)));
            }
            other => panic!("expected bulk, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let result: Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"mystery","payload":null}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_envelope_uses_tagged_wire_shape() {
        let json = serde_json::to_value(ServerEnvelope::FileRequest {
            download_id: "d1".into(),
            file_id: "f1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "file-request");
        assert_eq!(json["payload"]["downloadId"], "d1");
        assert_eq!(json["payload"]["fileId"], "f1");
    }

    #[test]
    fn stream_request_serializes_range() {
        let json = serde_json::to_value(ServerEnvelope::StreamRequest {
            stream_key: "k".into(),
            stream_id: "s".into(),
            file_id: "f".into(),
            range: [0, 255],
        })
        .unwrap();
        assert_eq!(json["type"], "stream-request");
        assert_eq!(json["payload"]["streamKey"], "k");
        assert_eq!(json["payload"]["range"][1], 255);
    }

    #[test]
    fn new_session_payload_is_the_key() {
        let json = serde_json::to_value(ServerEnvelope::NewSession("s3cret".into())).unwrap();
        assert_eq!(json["type"], "new-session");
        assert_eq!(json["payload"], "s3cret");
    }
}
