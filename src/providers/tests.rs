//! Provider tests with HTTP mocking.

mod classify_tests {
    use crate::error::UpdateError;
    use crate::providers::{classify, parse_retry_after};
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
    use reqwest::StatusCode;
    use std::time::Duration;

    fn status(code: u16) -> Option<UpdateError> {
        classify(StatusCode::from_u16(code).unwrap(), &HeaderMap::new(), "")
    }

    #[test]
    fn test_success_is_none() {
        assert_eq!(status(200), None);
        assert_eq!(status(204), None);
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(status(401), Some(UpdateError::Auth { status: 401 }));
        assert_eq!(status(403), Some(UpdateError::Auth { status: 403 }));
        assert!(matches!(status(404), Some(UpdateError::NotFound(_))));
        assert!(matches!(status(429), Some(UpdateError::RateLimited { retry_after: None })));
        assert!(matches!(status(500), Some(UpdateError::Transient(_))));
        assert!(matches!(status(503), Some(UpdateError::Transient(_))));
        assert!(matches!(status(400), Some(UpdateError::Permanent(_))));
        assert!(matches!(status(422), Some(UpdateError::Permanent(_))));
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(42)));

        let err = classify(StatusCode::TOO_MANY_REQUESTS, &headers, "").unwrap();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_retry_after_http_date_in_past() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_detail_includes_body() {
        let err = classify(StatusCode::BAD_REQUEST, &HeaderMap::new(), "invalid content").unwrap();
        assert_eq!(
            err,
            UpdateError::Permanent("HTTP 400: invalid content".to_string())
        );
    }
}

mod ionos_tests {
    use crate::error::UpdateError;
    use crate::providers::{IonosClient, UpdateClient};
    use crate::record::{ManagedRecord, RecordType, ResolvedAddress};
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> IonosClient {
        IonosClient::with_base_url(
            "prefix.secret".to_string(),
            server.uri(),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn address(ip: &str) -> ResolvedAddress {
        ResolvedAddress::new(ip.parse().unwrap(), "test")
    }

    async fn mount_lookup(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/zones"))
            .and(header("X-API-Key", "prefix.secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "zone-root", "name": "example.com", "type": "NATIVE"},
                {"id": "zone-other", "name": "example.org", "type": "NATIVE"}
            ])))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/zones/zone-root"))
            .and(query_param("recordName", "home.example.com"))
            .and(query_param("recordType", "A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "zone-root",
                "name": "example.com",
                "records": [
                    {"id": "rec-1", "name": "home.example.com", "type": "A", "content": "1.1.1.1", "ttl": 60}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_update_success_looks_up_ids_once() {
        let server = MockServer::start().await;
        mount_lookup(&server).await;

        Mock::given(method("PUT"))
            .and(path("/zones/zone-root/records/rec-1"))
            .and(header("X-API-Key", "prefix.secret"))
            .and(body_json(serde_json::json!({
                "content": "1.1.1.2",
                "ttl": 60,
                "prio": 0,
                "disabled": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "rec-1", "name": "home.example.com", "type": "A", "content": "1.1.1.2"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server);
        let record = ManagedRecord::new("home.example.com", RecordType::A);

        client.update_record(&record, &address("1.1.1.2")).await.unwrap();
        client.update_record(&record, &address("1.1.1.2")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let zone_lists = requests.iter().filter(|r| r.url.path() == "/zones").count();
        assert_eq!(zone_lists, 1, "zone lookup should be cached");
    }

    #[tokio::test]
    async fn test_configured_ids_skip_lookup() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/zones/z/records/r"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut record = ManagedRecord::new("home.example.com", RecordType::A);
        record.zone_id = Some("z".to_string());
        record.record_id = Some("r".to_string());

        client(&server)
            .update_record(&record, &address("203.0.113.1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"id": "zone-root", "name": "example.com"}])),
            )
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/zones/zone-root"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "zone-root", "records": []})),
            )
            .mount(&server)
            .await;

        let record = ManagedRecord::new("missing.example.com", RecordType::A);
        let err = client(&server)
            .update_record(&record, &address("203.0.113.1"))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_zone_is_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"id": "z", "name": "example.org"}])),
            )
            .mount(&server)
            .await;

        let record = ManagedRecord::new("home.example.com", RecordType::A);
        let err = client(&server).validate(&record).await.unwrap_err();
        assert!(matches!(err, UpdateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(ResponseTemplate::new(401).set_body_string(r#"[{"code":"UNAUTHORIZED"}]"#))
            .mount(&server)
            .await;

        let record = ManagedRecord::new("home.example.com", RecordType::A);
        let err = client(&server)
            .update_record(&record, &address("203.0.113.1"))
            .await
            .unwrap_err();

        assert_eq!(err, UpdateError::Auth { status: 401 });
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        mount_lookup(&server).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;

        let record = ManagedRecord::new("home.example.com", RecordType::A);
        let err = client(&server)
            .update_record(&record, &address("1.1.1.2"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        mount_lookup(&server).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let record = ManagedRecord::new("home.example.com", RecordType::A);
        let err = client(&server)
            .update_record(&record, &address("1.1.1.2"))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Transient(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut record = ManagedRecord::new("home.example.com", RecordType::A);
        record.zone_id = Some("z".to_string());
        record.record_id = Some("r".to_string());

        let err = client(&server)
            .update_record(&record, &address("1.1.1.2"))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Transient(_)));
    }

    #[tokio::test]
    async fn test_not_found_on_write_evicts_cached_ids() {
        let server = MockServer::start().await;
        mount_lookup(&server).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        let record = ManagedRecord::new("home.example.com", RecordType::A);

        for _ in 0..2 {
            let err = client
                .update_record(&record, &address("1.1.1.2"))
                .await
                .unwrap_err();
            assert!(matches!(err, UpdateError::NotFound(_)));
        }

        let requests = server.received_requests().await.unwrap();
        let zone_lists = requests.iter().filter(|r| r.url.path() == "/zones").count();
        assert_eq!(zone_lists, 2);
    }

    #[tokio::test]
    async fn test_family_mismatch_is_permanent() {
        let server = MockServer::start().await;
        let record = ManagedRecord::new("home.example.com", RecordType::A);

        let err = client(&server)
            .update_record(&record, &address("2001:db8::1"))
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Permanent(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(IonosClient::new(String::new(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let client = IonosClient::new("prefix.secret".to_string(), Duration::from_secs(1)).unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("REDACTED"));
    }
}
