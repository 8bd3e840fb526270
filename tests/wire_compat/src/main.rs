fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use ezlo_hub_connection::predicates;
    use ezlo_protocol::{Message, describe_error, method, subclass};
    use serde_json::Value;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture and parses it the way the read pump does.
    fn load_fixture(name: &str) -> Message {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        Message::from_text(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Parses a fixture, re-serializes it, and checks nothing was lost.
    fn roundtrip_test(name: &str) {
        let msg = load_fixture(name);
        let original: Value = serde_json::from_str(
            &fs::read_to_string(fixtures_dir().join(name)).unwrap(),
        )
        .unwrap();
        let reserialized: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(
            original, reserialized,
            "roundtrip mismatch for {name}:\n  hub:  {original}\n  ours: {reserialized}"
        );
    }

    #[test]
    fn every_fixture_roundtrips() {
        let mut count = 0;
        for entry in fs::read_dir(fixtures_dir()).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|ext| ext == "json") {
                roundtrip_test(path.file_name().unwrap().to_str().unwrap());
                count += 1;
            }
        }
        assert!(count >= 10, "expected the fixture set, found {count} files");
    }

    // --- Requests ---

    #[test]
    fn fixture_login_request() {
        let msg = load_fixture("login_request.json");
        assert_eq!(msg.method(), Some(method::LOGIN));
        assert_eq!(msg.params().unwrap()["user"], "installer");

        let ours = Message::request(
            method::LOGIN,
            serde_json::json!({
                "user": "installer",
                "token": "d1f5c2a6b0e94f3c8a7e5b4d3c2b1a09",
            }),
        );
        assert_eq!(ours.method(), msg.method());
        assert_eq!(ours.params(), msg.params());
    }

    // --- Responses ---

    #[test]
    fn fixture_hub_info_response() {
        let msg = load_fixture("hub_info_response.json");
        assert!(!msg.is_broadcast());
        assert!(msg.error().is_none());
        assert_eq!(msg.pointer("/result/serial"), Some(&Value::from("90000330")));
        assert_eq!(msg.pointer("/result/location/timezone"), Some(&Value::from("America/New_York")));
    }

    #[test]
    fn fixture_scenes_list_response() {
        let result = load_fixture("scenes_list_response.json").into_result();
        let scenes = result["scenes"].as_array().unwrap();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0]["name"], "Good Night");
    }

    #[test]
    fn fixture_rooms_list_response_is_a_bare_array() {
        let result = load_fixture("rooms_list_response.json").into_result();
        assert_eq!(result.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn fixture_modes_responses() {
        let current = load_fixture("modes_current_response.json");
        assert_eq!(current.pointer("/result/modeId"), Some(&Value::from("1")));

        let switch = load_fixture("modes_switch_response.json");
        assert_eq!(
            switch.pointer("/result/switchToDelay").and_then(Value::as_f64),
            Some(30.0)
        );
    }

    #[test]
    fn fixture_error_response() {
        let msg = load_fixture("error_response.json");
        assert!(msg.result().is_none());
        assert_eq!(msg.error_message().as_deref(), Some("Unknown scene id"));
    }

    #[test]
    fn fixture_already_logged_in_is_recognized() {
        let msg = load_fixture("login_already_logged_in.json");
        let reason = describe_error(msg.error().unwrap()).to_ascii_lowercase();
        assert!(reason.contains(ezlo_protocol::constants::ALREADY_LOGGED_IN));
    }

    // --- Broadcasts ---

    #[test]
    fn fixture_scene_run_progress() {
        let msg = load_fixture("scene_run_progress.json");
        assert!(msg.is_broadcast());
        assert_eq!(msg.msg_subclass(), Some(subclass::SCENE_RUN_PROGRESS));
        assert!(predicates::scene_finished("scene_6123f4a5")(&msg));
        assert!(!predicates::scene_finished("scene_6123f4b7")(&msg));
    }

    #[test]
    fn fixture_modes_switched() {
        let msg = load_fixture("modes_switched.json");
        assert!(msg.is_broadcast());
        assert!(predicates::house_mode_switched("2")(&msg));
        assert!(!predicates::house_mode_switched("1")(&msg));
        assert!(!predicates::scene_finished("2")(&msg));
    }

    #[test]
    fn fixture_item_updated() {
        let msg = load_fixture("item_updated.json");
        assert!(predicates::is_broadcast()(&msg));
        assert!(predicates::broadcast_subclass(subclass::ITEM_UPDATED)(&msg));
        assert_eq!(msg.pointer("/result/value"), Some(&Value::Bool(true)));
    }
}
