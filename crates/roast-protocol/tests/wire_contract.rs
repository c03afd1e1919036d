/// Wire-contract tests for the shared protocol types.
///
/// The inbound payload shape is flat: `ts`/`sig`/`kid` sit next to the
/// sample fields, and unknown keys must be retained rather than rejected.
use roast_protocol::{
    CloseReason, EventPayload, Origin, RoastEvent, RoastEventType, StreamFilter, TelemetrySample,
    TrustAnnotation, TrustFailure, report_idempotency_key,
};

#[test]
fn telemetry_sample_retains_unknown_keys_as_extras() {
    let json = r#"{
        "ts": "2026-03-01T08:15:00Z",
        "machineId": "r2",
        "elapsedSeconds": 42.5,
        "btC": 184.2,
        "gasPct": 60,
        "firmware": "3.1.4"
    }"#;

    let sample: TelemetrySample = serde_json::from_str(json).expect("flat sample should parse");
    assert_eq!(sample.machine_id, "r2");
    assert!((sample.elapsed_seconds - 42.5).abs() < f64::EPSILON);
    assert_eq!(sample.bt_c, Some(184.2));
    assert_eq!(sample.et_c, None);
    assert_eq!(sample.extras.get("gasPct"), Some(&serde_json::json!(60)));
    assert_eq!(
        sample.extras.get("firmware"),
        Some(&serde_json::json!("3.1.4"))
    );
}

#[test]
fn telemetry_sample_serializes_extras_flat() {
    let json = r#"{"ts":"2026-03-01T08:15:00Z","machineId":"r2","elapsedSeconds":0.0,"gasPct":55}"#;
    let sample: TelemetrySample = serde_json::from_str(json).expect("parse");
    let back = serde_json::to_value(&sample).expect("serialize");
    assert_eq!(back.get("gasPct"), Some(&serde_json::json!(55)));
    // Absent channels must not appear as nulls.
    assert!(back.get("btC").is_none());
}

#[test]
fn roast_event_type_is_an_open_set() {
    let json = r#"{
        "ts": "2026-03-01T08:21:00Z",
        "machineId": "r2",
        "type": "COLOR_CHECK",
        "payload": {"elapsedSeconds": 360.0, "agtron": 58}
    }"#;

    let event: RoastEvent = serde_json::from_str(json).expect("event should parse");
    assert_eq!(
        event.event_type,
        RoastEventType::Other("COLOR_CHECK".to_owned())
    );
    assert_eq!(event.payload.elapsed_seconds, Some(360.0));
    assert_eq!(event.payload.extra.get("agtron"), Some(&serde_json::json!(58)));

    let back = serde_json::to_value(&event).expect("serialize");
    assert_eq!(back.get("type"), Some(&serde_json::json!("COLOR_CHECK")));
}

#[test]
fn known_event_types_round_trip_their_wire_names() {
    for (wire, parsed) in [
        ("TP", RoastEventType::Tp),
        ("FC", RoastEventType::Fc),
        ("DROP", RoastEventType::Drop),
    ] {
        assert_eq!(RoastEventType::parse(wire), parsed);
        assert_eq!(parsed.as_str(), wire);
    }
}

#[test]
fn event_payload_defaults_when_missing() {
    let json = r#"{"ts":"2026-03-01T08:21:00Z","machineId":"r2","type":"DROP"}"#;
    let event: RoastEvent = serde_json::from_str(json).expect("parse");
    assert_eq!(event.event_type, RoastEventType::Drop);
    assert_eq!(event.payload, EventPayload::default());
}

#[test]
fn trust_failure_reasons_use_screaming_snake_case() {
    let annotation = TrustAnnotation::failed(TrustFailure::BadSignature, Some("k1".to_owned()));
    let json = serde_json::to_value(&annotation).expect("serialize");
    assert_eq!(json.get("reason"), Some(&serde_json::json!("BAD_SIGNATURE")));
    assert_eq!(json.get("verified"), Some(&serde_json::json!(false)));

    let unsigned = TrustAnnotation::failed(TrustFailure::MissingSig, None);
    assert!(unsigned.is_unsigned());
    assert!(!annotation.is_unsigned());
}

#[test]
fn close_reason_wire_names() {
    assert_eq!(
        serde_json::to_value(CloseReason::Drop).expect("serialize"),
        serde_json::json!("DROP")
    );
    assert_eq!(
        serde_json::to_value(CloseReason::SilenceClose).expect("serialize"),
        serde_json::json!("SILENCE_CLOSE")
    );
}

#[test]
fn stream_filter_unset_fields_match_any_origin() {
    let origin = Origin {
        org_id: "acme".to_owned(),
        site_id: "plant-1".to_owned(),
        machine_id: "r2".to_owned(),
    };

    assert!(StreamFilter::default().matches(&origin));
    assert!(
        StreamFilter {
            org_id: Some("acme".to_owned()),
            ..StreamFilter::default()
        }
        .matches(&origin)
    );
    assert!(
        !StreamFilter {
            org_id: Some("acme".to_owned()),
            machine_id: Some("r9".to_owned()),
            ..StreamFilter::default()
        }
        .matches(&origin)
    );
}

#[test]
fn report_idempotency_key_is_goal_kind_session() {
    assert_eq!(
        report_idempotency_key("POST_ROAST_V1", "S-acme-plant-1-r2-20260301T081500-a1b2c3"),
        "generate-roast-report:POST_ROAST_V1:S-acme-plant-1-r2-20260301T081500-a1b2c3"
    );
}
