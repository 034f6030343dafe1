//! Upload integration tests
//!
//! Covers the single-request multipart upload, the resumable session protocol
//! (including partial chunk acceptance) and write handle lifecycle.

mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use bytes::Bytes;
    use kumofs::checker::md5_base64;
    use kumofs::config::MAX_REQUEST_SIZE;
    use kumofs::upload::WriteOptions;
    use kumofs::StorageError;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SESSION: &str = "/upload/session/xyz-0123456789";
    const CHUNK: usize = 256 * 1024;

    fn upload_path() -> String {
        format!("/upload/storage/v1/b/{}/o", BUCKET)
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(upload_path()))
            .and(query_param("uploadType", "resumable"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("location", format!("{}{}", server.uri(), SESSION).as_str()),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    fn chunk_mock(content_range: &str, response: ResponseTemplate) -> Mock {
        Mock::given(method("PUT"))
            .and(path(SESSION))
            .and(header("content-range", content_range))
            .respond_with(response)
    }

    fn incomplete(last_byte: u64) -> ResponseTemplate {
        ResponseTemplate::new(308).insert_header("range", format!("bytes=0-{}", last_byte).as_str())
    }

    // ========================================================================
    // TEST: simple upload
    // ========================================================================

    #[tokio::test]
    async fn test_small_payload_uses_single_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(upload_path()))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("\"name\":\"notes/hello.txt\""))
            .and(body_string_contains("hello world"))
            .respond_with(ResponseTemplate::new(200).set_body_json(object_json("notes/hello.txt", 11)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let result = client
            .pipe_file(
                "gs://test-bucket/notes/hello.txt",
                Bytes::from_static(b"hello world"),
                Some("text/plain"),
            )
            .await
            .unwrap();

        assert_eq!(result.bytes_written, 11);
        assert_eq!(result.chunk_round_trips, 0);
        assert_eq!(result.object.size, 11);
    }

    #[tokio::test]
    async fn test_upload_md5_mismatch_detected() {
        let server = MockServer::start().await;
        let mut object = object_json("k.txt", 3);
        object["md5Hash"] = json!(md5_base64(b"xyz"));
        Mock::given(method("POST"))
            .and(path(upload_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(object))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.transfer.consistency = "md5".into();
        let client = client_with(config);

        let err = client
            .pipe_file("test-bucket/k.txt", Bytes::from_static(b"abc"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch(_)));
    }

    // ========================================================================
    // TEST: resumable upload
    // ========================================================================

    #[tokio::test]
    async fn test_resumable_upload_two_round_trips() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        chunk_mock("bytes 0-262143/*", incomplete(262_143))
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock(
            "bytes 262144-299999/300000",
            ResponseTemplate::new(200).set_body_json(object_json("big.bin", 300_000)),
        )
        .expect(1)
        .mount(&server)
        .await;

        let client = client(&server.uri());
        let data = Bytes::from(vec![0x5au8; 300_000]);
        let result = client
            .pipe_file("test-bucket/big.bin", data, None)
            .await
            .unwrap();

        assert_eq!(result.chunk_round_trips, 2);
        assert_eq!(result.bytes_written, 300_000);
        assert_eq!(result.object.size, 300_000);
    }

    #[tokio::test]
    async fn test_partial_acceptance_resends_tail() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        // Backend keeps only the first half of the first chunk
        chunk_mock("bytes 0-262143/*", incomplete(131_071))
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock("bytes 131072-262143/*", incomplete(262_143))
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock(
            "bytes 262144-299999/300000",
            ResponseTemplate::new(200).set_body_json(object_json("big.bin", 300_000)),
        )
        .expect(1)
        .mount(&server)
        .await;

        let client = client(&server.uri());
        let result = client
            .pipe_file("test-bucket/big.bin", Bytes::from(vec![1u8; 300_000]), None)
            .await
            .unwrap();
        assert_eq!(result.chunk_round_trips, 3);
        assert_eq!(result.object.size, 300_000);
    }

    #[tokio::test]
    async fn test_stalled_session_is_protocol_error() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        // A 308 without a Range header means nothing was persisted
        Mock::given(method("PUT"))
            .and(path(SESSION))
            .respond_with(ResponseTemplate::new(308))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(SESSION))
            .respond_with(ResponseTemplate::new(499))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let err = client
            .pipe_file("test-bucket/big.bin", Bytes::from(vec![0u8; 300_000]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_implausible_session_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(upload_path()))
            .and(query_param("uploadType", "resumable"))
            .respond_with(ResponseTemplate::new(200).insert_header("location", "/x"))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let err = client
            .pipe_file("test-bucket/big.bin", Bytes::from(vec![0u8; 300_000]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Protocol(_)));
    }

    // ========================================================================
    // TEST: write handles
    // ========================================================================

    #[tokio::test]
    async fn test_writer_discard_cancels_session() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        chunk_mock("bytes 0-262143/*", incomplete(262_143))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(SESSION))
            .respond_with(ResponseTemplate::new(499))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let mut writer = client
            .open_write("test-bucket/partial.bin", WriteOptions::default())
            .unwrap();
        writer.write(&vec![0u8; CHUNK + 10]).await.unwrap();
        writer.discard().await;

        assert!(writer.is_closed());
        assert!(matches!(
            writer.write(b"more").await,
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_failed_chunk_abandons_object() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        // Only the failing chunk may reach the session; nothing is ever sealed
        Mock::given(method("PUT"))
            .and(path(SESSION))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(SESSION))
            .respond_with(ResponseTemplate::new(499))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server.uri());
        config.retry.max_attempts = 1;
        config.transfer.consistency = "size".into();
        let client = client_with(config);

        let mut writer = client
            .open_write("test-bucket/lost.bin", WriteOptions::default())
            .unwrap();
        let err = writer.write(&vec![0u8; CHUNK + 1000]).await.unwrap_err();
        assert!(matches!(err, StorageError::Http { code: 503, .. }));
        assert!(writer.is_failed());

        assert!(matches!(
            writer.write(b"more").await,
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.flush().await,
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.close().await,
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_writer_chunk_override_capped_at_request_limit() {
        let client = client("http://127.0.0.1:9");
        let options = WriteOptions {
            chunk_size: Some(2 * MAX_REQUEST_SIZE),
            ..Default::default()
        };
        let writer = client.open_write("test-bucket/huge.bin", options).unwrap();
        assert_eq!(writer.chunk_size(), MAX_REQUEST_SIZE);
    }

    #[tokio::test]
    async fn test_writer_flush_sends_aligned_chunks() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        chunk_mock("bytes 0-262143/*", incomplete(262_143))
            .expect(1)
            .mount(&server)
            .await;
        chunk_mock(
            "bytes 262144-262243/262244",
            ResponseTemplate::new(200).set_body_json(object_json("f.bin", 262_244)),
        )
        .expect(1)
        .mount(&server)
        .await;

        let client = client(&server.uri());
        let options = WriteOptions {
            chunk_size: Some(4 * CHUNK),
            ..Default::default()
        };
        let mut writer = client.open_write("test-bucket/f.bin", options).unwrap();
        writer.write(&vec![9u8; CHUNK + 100]).await.unwrap();
        // Only the aligned 256 KiB prefix goes out; 100 bytes stay buffered
        writer.flush().await.unwrap();
        let result = writer.close().await.unwrap();

        assert_eq!(result.chunk_round_trips, 2);
        assert_eq!(result.bytes_written, 262_244);
    }

    #[tokio::test]
    async fn test_put_file_from_disk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(upload_path()))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("local contents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(object_json("up.txt", 14)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("up.txt");
        std::fs::write(&local, b"local contents").unwrap();

        let client = client(&server.uri());
        let result = client.put_file(&local, "test-bucket/up.txt").await.unwrap();
        assert_eq!(result.bytes_written, 14);
    }

    #[tokio::test]
    async fn test_put_recursive_keeps_layout() {
        let server = MockServer::start().await;
        for name in ["dest/x.txt", "dest/sub/y.txt"] {
            Mock::given(method("POST"))
                .and(path(upload_path()))
                .and(query_param("uploadType", "multipart"))
                .and(body_string_contains(format!("\"name\":\"{}\"", name).as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_json(object_json(name, 1)))
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("x.txt"), b"x").unwrap();
        std::fs::write(src.join("sub/y.txt"), b"y").unwrap();

        // The destination does not exist, so the tree lands directly below it
        let client = client(&server.uri());
        let results = client.put(&src, "test-bucket/dest", true).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.bytes_written == 1));
    }

    #[tokio::test]
    async fn test_upload_invalidates_parent_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(objects_path()))
            .and(query_param("prefix", "dir/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_json(&[("dir/a", 1)], &[])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(upload_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(object_json("dir/b", 1)))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        client
            .ls("test-bucket/dir", Default::default())
            .await
            .unwrap();
        assert!(client.cache().contains("test-bucket/dir"));

        client.touch("test-bucket/dir/b").await.unwrap();
        assert!(!client.cache().contains("test-bucket/dir"));
    }
}
