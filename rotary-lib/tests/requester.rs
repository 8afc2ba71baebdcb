#[cfg(test)]
mod requester {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use reqwest::{Method, Request};
    use rotary_lib::{
        CaptchaConnector, CaptchaEndpoint, CaptchaSolver, Config, CookieProvider, ErrorKind,
        Outcome, RequesterBuilder, Result, StaticCookies, StaticProxies, ThrottleKey,
    };
    use test_utils::{flaky_mock_server, mock_server};
    use url::Url;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(clients: usize) -> Config {
        Config {
            default_clients_count: clients,
            ..Config::default()
        }
    }

    fn throttled(clients: usize) -> Config {
        let mut config = config(clients);
        config.throttle.enabled = true;
        config.throttle.min_rps = 1;
        config.throttle.max_rps = 1;
        config
    }

    struct CountedCookies;

    #[async_trait]
    impl CookieProvider for CountedCookies {
        async fn cookies(&self, n: usize) -> Result<Vec<String>> {
            Ok((0..n).map(|i| format!("slot={i}")).collect())
        }
    }

    struct TruncatedCookies;

    #[async_trait]
    impl CookieProvider for TruncatedCookies {
        async fn cookies(&self, n: usize) -> Result<Vec<String>> {
            Ok(vec![String::new(); n - 1])
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl CaptchaConnector for HangingConnector {
        async fn connect(&self, _endpoint: &CaptchaEndpoint) -> Result<Arc<dyn CaptchaSolver>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_round_robin() {
        let requester = RequesterBuilder::builder()
            .config(config(3))
            .build()
            .start()
            .await
            .unwrap();

        let ids: Vec<_> = (0..4).map(|_| requester.get_client().unwrap().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0]);
        assert_eq!(requester.clients_count(), 3);
        assert!(!requester.is_proxy_enabled());
    }

    #[tokio::test]
    async fn test_client_by_id_and_no_proxy() {
        let requester = RequesterBuilder::builder()
            .config(config(2))
            .cookie_provider(Arc::new(CountedCookies))
            .build()
            .start()
            .await
            .unwrap();

        assert_eq!(requester.get_client_by_id(1).unwrap().saved_cookies(), "slot=1");
        assert_eq!(
            requester.get_client_by_id(2).unwrap_err(),
            ErrorKind::ClientIdOutOfRange { id: 2, size: 2 }
        );

        let no_proxy = requester.get_client_no_proxy();
        assert_eq!(no_proxy.id(), 2);
        assert_eq!(no_proxy.saved_cookies(), "slot=2");
        assert_eq!(no_proxy.proxy_url(), None);
    }

    #[tokio::test]
    async fn test_proxy_rotation_sizes_pool() {
        let mut config = config(10);
        config.proxy.enabled = true;
        config.proxy.host = "proxies.internal".to_string();
        config.proxy.port = 8080;
        config.proxy.timeout = Duration::from_secs(5);
        config.proxy.list = "residential".to_string();

        let proxies = vec![
            Url::parse("http://10.0.0.1:8080").unwrap(),
            Url::parse("socks5://10.0.0.2:1080").unwrap(),
        ];
        let requester = RequesterBuilder::builder()
            .config(config)
            .proxy_source(Arc::new(StaticProxies(proxies)))
            .build()
            .start()
            .await
            .unwrap();

        assert_eq!(requester.clients_count(), 2);
        assert_eq!(
            requester.get_client_by_id(1).unwrap().proxy_host().as_deref(),
            Some("10.0.0.2:1080")
        );
        assert_eq!(requester.get_client_no_proxy().proxy_url(), None);
    }

    #[tokio::test]
    async fn test_cookie_mismatch_fails_start() {
        let err = RequesterBuilder::builder()
            .config(config(3))
            .cookie_provider(Arc::new(TruncatedCookies))
            .build()
            .start()
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ErrorKind::RefreshFailed(Box::new(ErrorKind::CookieCountMismatch {
                requested: 4,
                received: 3,
            }))
        );
    }

    #[tokio::test]
    async fn test_missing_collaborators_fail_start() {
        let mut proxied = config(1);
        proxied.proxy.enabled = true;
        proxied.proxy.host = "proxies.internal".to_string();
        proxied.proxy.port = 8080;
        proxied.proxy.timeout = Duration::from_secs(5);
        proxied.proxy.list = "residential".to_string();

        let mut user_agents = config(1);
        user_agents.enable_user_agents = true;

        let mut captcha = config(1);
        captcha.captcha.enabled = true;
        captcha.captcha.solver.host = "127.0.0.1".to_string();
        captcha.captcha.solver.port = 9000;
        captcha.captcha.solver.timeout = Duration::from_secs(1);

        for config in [proxied, user_agents, captcha] {
            let err = RequesterBuilder::builder()
                .config(config)
                .build()
                .start()
                .await
                .unwrap_err();
            assert!(
                matches!(err, ErrorKind::CollaboratorUnavailable { .. }),
                "unexpected error: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let err = RequesterBuilder::builder()
            .config(config(0))
            .build()
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_captcha_connect_timeout() {
        let mut config = config(1);
        config.captcha.enabled = true;
        config.captcha.solver.host = "127.0.0.1".to_string();
        config.captcha.solver.port = 9000;
        config.captcha.solver.timeout = Duration::from_millis(20);

        let err = RequesterBuilder::builder()
            .config(config)
            .captcha_connector(Arc::new(HangingConnector))
            .build()
            .start()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_execute_reports_outcome() {
        let mock_server = mock_server!(StatusCode::OK);
        let url = Url::parse(&mock_server.uri()).unwrap();

        let requester = RequesterBuilder::builder()
            .config(throttled(1))
            .build()
            .start()
            .await
            .unwrap();

        let (client, response) = requester
            .execute(Request::new(Method::GET, url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let key = ThrottleKey::new(Some(client.id()), url.host_str().unwrap().into());
        let stats = requester.throttle().stats_for(&key).unwrap();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_execute_counts_failures() {
        let mock_server = mock_server!(StatusCode::TOO_MANY_REQUESTS);
        let url = Url::parse(&mock_server.uri()).unwrap();

        let requester = RequesterBuilder::builder()
            .config(throttled(1))
            .build()
            .start()
            .await
            .unwrap();

        let (client, response) = requester
            .execute(Request::new(Method::GET, url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let key = requester.throttle().key(client.id(), &url).unwrap();
        assert_eq!(requester.throttle().stats_for(&key).unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_recovery_after_failure() {
        let mock_server = flaky_mock_server!(StatusCode::SERVICE_UNAVAILABLE, 1);
        let url = Url::parse(&mock_server.uri()).unwrap();

        let mut config = throttled(1);
        config.throttle.per_client = false;
        config.throttle.max_rps = 10;
        let requester = RequesterBuilder::builder()
            .config(config)
            .build()
            .start()
            .await
            .unwrap();

        let client = requester.get_client_by_id(0).unwrap();
        for expected in [StatusCode::SERVICE_UNAVAILABLE, StatusCode::OK] {
            let response = requester
                .execute_on(&client, Request::new(Method::GET, url.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }

        let key = ThrottleKey::new(None, url.host_str().unwrap().into());
        let stats = requester.throttle().stats_for(&key).unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test]
    async fn test_seeded_cookies_are_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;
        let url = Url::parse(&mock_server.uri()).unwrap();

        let mut config = config(1);
        config.cookie_url = Some(url.clone());
        let requester = RequesterBuilder::builder()
            .config(config)
            .cookie_provider(Arc::new(StaticCookies("session=abc".to_string())))
            .build()
            .start()
            .await
            .unwrap();

        let client = requester.get_client().unwrap();
        assert_eq!(client.cookie_header(&url).unwrap(), "session=abc");
        let response = client.get(url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_throttled_client_admission_timeout() {
        let mut config = throttled(1);
        config.throttle.wait_client_timeout = Duration::from_millis(50);
        let requester = RequesterBuilder::builder()
            .config(config)
            .build()
            .start()
            .await
            .unwrap();
        let url = Url::parse("https://example.com/").unwrap();

        requester.get_throttled_client(&url).await.unwrap();
        let err = requester.get_throttled_client(&url).await.unwrap_err();
        assert!(
            matches!(err, ErrorKind::AdmissionTimeout { ref host, .. } if host == "example.com"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_throttled_client_rotates_to_free_identity() {
        let requester = RequesterBuilder::builder()
            .config(throttled(2))
            .build()
            .start()
            .await
            .unwrap();
        let url = Url::parse("https://example.com/").unwrap();

        let first = requester.get_throttled_client(&url).await.unwrap();
        let second = requester.get_throttled_client(&url).await.unwrap();
        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
    }

    #[tokio::test]
    async fn test_throttled_no_proxy_does_not_wait() {
        let requester = RequesterBuilder::builder()
            .config(throttled(1))
            .build()
            .start()
            .await
            .unwrap();
        let url = Url::parse("https://example.com/").unwrap();

        requester.get_throttled_client_no_proxy(&url).unwrap();
        let err = requester.get_throttled_client_no_proxy(&url).unwrap_err();
        assert!(matches!(err, ErrorKind::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_callers() {
        let mut config = throttled(1);
        config.throttle.wait_client_timeout = Duration::from_secs(30);
        let requester = Arc::new(
            RequesterBuilder::builder()
                .config(config)
                .build()
                .start()
                .await
                .unwrap(),
        );
        let url = Url::parse("https://example.com/").unwrap();
        requester.get_throttled_client(&url).await.unwrap();

        let waiting = {
            let requester = Arc::clone(&requester);
            let url = url.clone();
            tokio::spawn(async move { requester.get_throttled_client(&url).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        requester.shutdown();

        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err, ErrorKind::Shutdown);
    }

    #[tokio::test]
    async fn test_report_without_throttling_is_noop() {
        let requester = RequesterBuilder::builder()
            .config(config(1))
            .build()
            .start()
            .await
            .unwrap();
        let client = requester.get_client().unwrap();
        let url = Url::parse("https://example.com/").unwrap();

        requester.report(&client, &url, Outcome::Failure).unwrap();
        assert!(requester.throttle().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_publishes_new_generation() {
        let requester = RequesterBuilder::builder()
            .config(config(2))
            .build()
            .start()
            .await
            .unwrap();
        let before = requester.generation();

        requester.refresh().await.unwrap();
        let after = requester.generation();
        assert!(after.number() > before.number());
        assert_eq!(after.len(), 2);
        // Snapshots taken before the refresh stay usable
        assert_eq!(before.clients()[1].id(), 1);
    }

    #[tokio::test]
    async fn test_user_agent_without_catalog() {
        let requester = RequesterBuilder::builder()
            .config(config(1))
            .build()
            .start()
            .await
            .unwrap();
        assert_eq!(requester.user_agent().unwrap_err(), ErrorKind::NoUserAgent(None));
        assert_eq!(
            requester.user_agent_for_hardware("mobile").unwrap_err(),
            ErrorKind::NoUserAgent(Some("mobile".to_string()))
        );
    }
}
