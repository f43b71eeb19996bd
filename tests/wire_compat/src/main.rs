fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use repeater_protocol::codec;
    use repeater_protocol::{
        ErrorCode, HttpMethod, Protocol, RegisterRepeaterCommand, RegisterRepeaterResult,
        RepeaterRegisteringError, RepeaterStatus, RepeaterStatusEvent, RequestExecutingEvent,
        RequestExecutingResult,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn parse_fixture<T: serde::de::DeserializeOwned>(name: &str) -> T {
        codec::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (key order is irrelevant).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = codec::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  rust: {reserialized}"
        );
        parsed
    }

    // --- Request execution ---

    #[test]
    fn fixture_request_executing_http() {
        let request = roundtrip_test::<RequestExecutingEvent>("request_executing_http.json");
        assert_eq!(request.protocol, Protocol::Http);
        assert_eq!(request.method, HttpMethod::POST);
        assert_eq!(
            request.headers.get("cookie").unwrap(),
            ["session=abc".to_string(), "theme=dark".to_string()]
        );
        assert!(request.correlation_id_regex.is_none());
    }

    #[test]
    fn fixture_request_executing_ws() {
        let request = roundtrip_test::<RequestExecutingEvent>("request_executing_ws.json");
        assert_eq!(request.protocol, Protocol::Ws);
        assert_eq!(request.correlation_id_regex.as_deref(), Some(r#""id":"42""#));
    }

    #[test]
    fn pascal_case_request_matches_camel_case() {
        let pascal: RequestExecutingEvent = parse_fixture("request_executing_pascal.json");
        let camel: RequestExecutingEvent = parse_fixture("request_executing_http.json");
        assert_eq!(pascal, camel);
    }

    #[test]
    fn upper_and_lower_case_fields_match_camel_case() {
        let camel = load_fixture("request_executing_http.json");
        let fold = |upper: bool| -> serde_json::Value {
            let object = camel.as_object().unwrap();
            object
                .iter()
                .map(|(k, v)| {
                    let key = if upper { k.to_ascii_uppercase() } else { k.to_ascii_lowercase() };
                    (key, v.clone())
                })
                .collect::<serde_json::Map<_, _>>()
                .into()
        };
        let expected: RequestExecutingEvent = codec::from_value(camel.clone()).unwrap();
        let upper: RequestExecutingEvent = codec::from_value(fold(true)).unwrap();
        let lower: RequestExecutingEvent = codec::from_value(fold(false)).unwrap();
        assert_eq!(upper, expected);
        assert_eq!(lower, expected);
        assert_eq!(upper.method, HttpMethod::POST);
    }

    #[test]
    fn fixture_request_executing_result_success() {
        let result =
            roundtrip_test::<RequestExecutingResult>("request_executing_result_success.json");
        assert_eq!(result.status_code, Some(200));
        assert!(!result.is_failure());
        assert_eq!(result.headers.get("set-cookie").map(<[String]>::len), Some(2));
    }

    #[test]
    fn fixture_request_executing_result_failure() {
        let result =
            roundtrip_test::<RequestExecutingResult>("request_executing_result_failure.json");
        assert_eq!(result.protocol, Protocol::Ws);
        assert_eq!(result.error_code, Some(ErrorCode::TimedOut));
        assert_eq!(result.status_code, None);
        assert_eq!(result.body, None);
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut fixture = load_fixture("request_executing_ws.json");
        fixture["protocol"] = serde_json::json!("ftp");
        let err = codec::from_value::<RequestExecutingEvent>(fixture).unwrap_err();
        assert!(err.to_string().contains("ftp"), "unexpected error: {err}");
    }

    #[test]
    fn unknown_error_code_is_rejected() {
        let mut fixture = load_fixture("request_executing_result_failure.json");
        fixture["errorCode"] = serde_json::json!("EWHATEVER");
        assert!(codec::from_value::<RequestExecutingResult>(fixture).is_err());
    }

    // --- Registration and status ---

    #[test]
    fn fixture_register_repeater_command() {
        let command = roundtrip_test::<RegisterRepeaterCommand>("register_repeater_command.json");
        assert_eq!(command.version, "1.4.2");
    }

    #[test]
    fn fixture_register_repeater_result_version() {
        let result =
            roundtrip_test::<RegisterRepeaterResult>("register_repeater_result_version.json");
        assert_eq!(result.payload.version.as_deref(), Some("1.5.0"));
        assert!(result.payload.error.is_none());
    }

    #[test]
    fn fixture_register_repeater_result_error() {
        let result =
            roundtrip_test::<RegisterRepeaterResult>("register_repeater_result_error.json");
        assert_eq!(
            result.payload.error,
            Some(RepeaterRegisteringError::RequiresToBeUpdated)
        );
        assert!(result.payload.version.is_none());
    }

    #[test]
    fn fixture_repeater_status_event() {
        let event = roundtrip_test::<RepeaterStatusEvent>("repeater_status_event.json");
        assert_eq!(event.status, RepeaterStatus::Connected);
    }

    #[test]
    fn status_tags_are_case_insensitive() {
        let event: RepeaterStatusEvent = codec::from_value(serde_json::json!({
            "RepeaterId": "r-1",
            "Status": "Disconnected"
        }))
        .unwrap();
        assert_eq!(event.repeater_id, "r-1");
        assert_eq!(event.status, RepeaterStatus::Disconnected);
    }
}
