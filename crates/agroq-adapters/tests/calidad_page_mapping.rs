use agroq_adapters::{dedup_key, map_record_at, QualityDataSource};
use agroq_core::QualityGrade;
use chrono::{TimeZone, Utc};
use serde_json::Value as JsonValue;

fn load_page() -> Vec<JsonValue> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/calidad-producto-terminado/page.json");
    let raw = std::fs::read_to_string(&path).expect("fixture page readable");
    serde_json::from_str(&raw).expect("fixture page is a JSON array")
}

#[test]
fn fixture_page_exists() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    assert!(root.join("fixtures/calidad-producto-terminado/page.json").exists());
}

#[test]
fn fixture_page_maps_into_quality_records() {
    let page = load_page();
    assert_eq!(page.len(), 3);
    let ingested_at = Utc.with_ymd_and_hms(2024, 11, 4, 9, 0, 0).single().unwrap();
    let mapped: Vec<_> = page.iter().map(|r| map_record_at(r, ingested_at)).collect();

    let first = &mapped[0];
    assert_eq!(first.company_label, "SAN LUCAR S.A.");
    assert_eq!(first.recorded_at, Utc.with_ymd_and_hms(2024, 11, 2, 0, 0, 0).single().unwrap());
    assert_eq!(first.measurements.temperature, Some(1.8));
    assert_eq!(first.measurements.soluble_solids, Some(13.4));
    assert_eq!(first.measurements.titratable_acidity, Some(0.62));
    assert_eq!(first.measurements.firmness, None);
    assert_eq!(first.defect_percentage, Some(1.2));
    assert_eq!(first.quality_grade, QualityGrade::Excellent);
    assert!(first.approved);
    assert_eq!(first.defect_description, "DESGARRO: 0.4%; MACHUCON: 0.8%");
    assert_eq!(first.caliber, "JUMBO");
    assert_eq!(first.color, "BILOXI");
    assert_eq!(first.external_record_id(), Some("cpt-2024-000118"));
    assert_eq!(
        first.extended_attributes.container_number,
        Some(serde_json::json!("MSKU1234567"))
    );
    let info = &first.processed_data()["additional_info"];
    assert_eq!(info["destino"], serde_json::json!("USA"));
    assert_eq!(info["peso_muestra"], serde_json::json!(250));
    assert_eq!(info["record_id"], serde_json::json!("cpt-2024-000118"));

    let second = &mapped[1];
    assert_eq!(second.recorded_at, Utc.with_ymd_and_hms(2024, 11, 3, 14, 5, 0).single().unwrap());
    assert_eq!(second.defect_percentage, Some(7.25));
    assert_eq!(second.quality_grade, QualityGrade::Fair);
    assert!(!second.approved);
    assert_eq!(
        second.defect_description,
        "HONGOS: 2.5%; BLANDA MODERADO: 3%; DESHIDRATACIÓN  LEVE: 1.75%"
    );

    let third = &mapped[2];
    assert_eq!(third.recorded_at, ingested_at);
    assert_eq!(third.measurements.temperature, None);
    assert_eq!(third.defect_percentage, Some(14.5));
    assert_eq!(third.quality_grade, QualityGrade::Poor);
    assert!(!third.approved);
    assert_eq!(third.external_record_id(), None);
}

#[test]
fn fixture_page_has_distinct_dedup_keys() {
    let page = load_page();
    let keys: std::collections::HashSet<_> = page.iter().map(dedup_key).collect();
    assert_eq!(keys.len(), page.len());
    assert!(dedup_key(&page[2]).starts_with("sha256:"));
}

fn assert_client_is_a_source<T: QualityDataSource>() {}

#[test]
fn api_client_serves_as_a_data_source() {
    assert_client_is_a_source::<agroq_adapters::ExternalApiClient>();
}
