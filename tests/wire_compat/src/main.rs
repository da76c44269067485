fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chunkferry_protocol::{
        ChunkFrameHeader, MergeRequest, MergeResponse, Message, MessageType, UploadChunkResponse,
        VerifyRequest, VerifyResponse, encode_chunk_frame, parse_chunk_frame,
    };
    use serde_json::json;

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Parses a fixture into `T`, serializes it again and compares the JSON
    /// values (key order does not matter).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let text = load_fixture(name);
        let parsed: T = serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_string(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        let expected: serde_json::Value = serde_json::from_str(&text).unwrap();
        let actual: serde_json::Value = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(
            expected, actual,
            "roundtrip mismatch for {name}:\n  fixture: {expected}\n  rust:    {actual}"
        );
        parsed
    }

    // --- Payloads ---

    #[test]
    fn fixture_verify_request() {
        let req: VerifyRequest = roundtrip_test("verify_request.json");
        assert_eq!(req.file_hash, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn fixture_verify_response_partial() {
        let resp: VerifyResponse = roundtrip_test("verify_response_partial.json");
        assert!(resp.should_upload);
        assert!(resp.message.is_none());
        assert_eq!(resp.uploaded_list.len(), 3);
    }

    #[test]
    fn fixture_verify_response_exists() {
        let resp: VerifyResponse = roundtrip_test("verify_response_exists.json");
        assert!(!resp.should_upload);
        assert!(resp.uploaded_list.is_empty());
    }

    #[test]
    fn fixture_merge_request() {
        let req: MergeRequest = roundtrip_test("merge_request.json");
        assert_eq!(req.chunk_size, 2 * 1024 * 1024);
        assert_eq!(req.size, Some(5 * 1024 * 1024));
    }

    #[test]
    fn fixture_merge_response() {
        let resp: MergeResponse = roundtrip_test("merge_response.json");
        assert!(resp.url.ends_with("/holiday.mp4"));
    }

    #[test]
    fn fixture_upload_chunk_response() {
        let ack: UploadChunkResponse = roundtrip_test("upload_chunk_response.json");
        assert!(ack.chunk_hash.ends_with("-2"));
    }

    #[test]
    fn fixture_chunk_frame_header() {
        let header: ChunkFrameHeader = roundtrip_test("chunk_frame_header.json");
        assert_eq!(header.checksum.len(), 64);
    }

    // --- Envelopes ---

    #[test]
    fn fixture_message_envelope() {
        let msg: Message = roundtrip_test("message_envelope.json");
        assert_eq!(msg.msg_type, MessageType::Verify);
        let req: VerifyRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(req.filename, "holiday.mp4");
    }

    #[test]
    fn fixture_error_envelope() {
        let msg: Message = roundtrip_test("error_envelope.json");
        assert_eq!(msg.msg_type, MessageType::Error);
        assert!(msg.payload.is_none());
        assert_eq!(msg.error.unwrap().code, 409);
    }

    // --- Literal shapes produced by constructors ---

    #[test]
    fn dedup_reply_shape() {
        let resp = VerifyResponse::already_exists("file already exists, upload skipped");
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({
                "shouldUpload": false,
                "message": "file already exists, upload skipped",
                "uploadedList": []
            })
        );
    }

    #[test]
    fn fresh_verify_reply_has_empty_list() {
        let resp = VerifyResponse::partial(Vec::new());
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"shouldUpload": true, "uploadedList": []})
        );
    }

    #[test]
    fn merge_request_without_size_omits_it() {
        let req = MergeRequest {
            file_hash: "5d41402abc4b2a76b9719d911017c592".into(),
            filename: "a.bin".into(),
            chunk_size: 4,
            size: None,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "fileHash": "5d41402abc4b2a76b9719d911017c592",
                "filename": "a.bin",
                "chunkSize": 4
            })
        );
    }

    #[test]
    fn message_types_use_snake_case() {
        let cases = [
            (MessageType::Verify, "verify"),
            (MessageType::UploadChunk, "upload_chunk"),
            (MessageType::Merge, "merge"),
            (MessageType::VerifyResponse, "verify_response"),
            (MessageType::UploadChunkResponse, "upload_chunk_response"),
            (MessageType::MergeResponse, "merge_response"),
            (MessageType::Ping, "ping"),
            (MessageType::Pong, "pong"),
            (MessageType::Error, "error"),
        ];
        for (ty, wire) in cases {
            assert_eq!(serde_json::to_value(&ty).unwrap(), json!(wire));
        }
    }

    #[test]
    fn chunk_frame_layout() {
        let header: ChunkFrameHeader =
            serde_json::from_str(&load_fixture("chunk_frame_header.json")).unwrap();
        let frame = encode_chunk_frame(&header, b"\x00\x01\x02").unwrap();

        let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let header_json: serde_json::Value =
            serde_json::from_slice(&frame[4..4 + header_len]).unwrap();
        assert_eq!(header_json["chunkHash"], json!(header.chunk_hash));
        assert_eq!(&frame[4 + header_len..], b"\x00\x01\x02");

        let (parsed, payload) = parse_chunk_frame(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, vec![0, 1, 2]);
    }
}
