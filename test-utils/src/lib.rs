//! `test-utils` is used for testing in both `rotary-lib` and `rotary-bin`.
//! This crate does not depend on `rotary-lib` or `rotary-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock web server, which responds with a predefined status when
/// handling a matching request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Create a mock web server which answers the first `$failures` requests
/// with `$status` and every later one with `200 OK`
#[macro_export]
macro_rules! flaky_mock_server {
    ($status:expr, $failures:expr) => {{
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(http::StatusCode::from($status)))
            .up_to_n_times($failures)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(http::StatusCode::OK))
            .mount(&mock_server)
            .await;
        mock_server
    }};
}

/// Gets the "main" binary name (e.g. `rotary`)
#[macro_export]
macro_rules! main_command {
    () => {
        Command::cargo_bin("rotary").expect("Couldn't get cargo binary")
    };
}
