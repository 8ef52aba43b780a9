//! Shared-file pub/sub (C9): the three versioned topics that let engines
//! locate holders and flip the `shared` flag on remote containers (§4.9).
//!
//! Topic strings follow §6's `defs@pubsub/Shared/<op>/<req|resp>/<version>`
//! convention; message bodies are compact-marshalled (`hashcodec`) the same
//! way every other on-wire/on-disk record in this crate is.

use serde::{Deserialize, Serialize};

const VERSION: &str = "v1";

pub fn set_shared_topic() -> String {
    format!("defs@pubsub/Shared/set-file-segment/request/{VERSION}")
}

pub fn search_request_topic() -> String {
    format!("defs@pubsub/Shared/search-file-segment/request/{VERSION}")
}

pub fn search_response_topic() -> String {
    format!("defs@pubsub/Shared/search-file-segment/response/{VERSION}")
}

/// Owner-initiated request to flip the `shared` flag on every node holding
/// a segment of `file_id`. Holders verify `addr_info`'s signer against the
/// P2PKH script embedded in their container before acting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetSharedRequest {
    pub file_id: String,
    pub pubkey_hash: [u8; 20],
    pub addr_info: Vec<u8>,
    pub enable_sharing: bool,
    /// Signature over `file_id || pubkey_hash || enable_sharing`, checked
    /// against the owner's pubkey_hash recorded in the held container.
    pub signature: Vec<u8>,
}

/// "Who has this file and what does it look like?" Published by the
/// download engine's locate step when no local `DownloadFileRecord` exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub file_id: String,
    pub addr_info: Vec<u8>,
}

/// Emitted by every holder with `shared=true` for the requested file.
/// Publishers must tolerate zero, one, or many responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub file_id: String,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub content_type: String,
    pub upload_time: i64,
    pub holder_peer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashcodec::{compact_marshal, compact_unmarshal};

    #[test]
    fn search_request_round_trips_through_compact_marshal() {
        let req = SearchRequest {
            file_id: "abc123".to_string(),
            addr_info: vec![1, 2, 3],
        };
        let bytes = compact_marshal(&req).unwrap();
        let back: SearchRequest = compact_unmarshal(&bytes).unwrap();
        assert_eq!(back.file_id, req.file_id);
        assert_eq!(back.addr_info, req.addr_info);
    }

    #[test]
    fn topic_strings_are_versioned_and_distinct() {
        let topics = [
            set_shared_topic(),
            search_request_topic(),
            search_response_topic(),
        ];
        assert!(topics.iter().all(|t| t.ends_with("/v1")));
        assert_eq!(
            topics.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }
}
