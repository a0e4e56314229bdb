//! Core domain model for AGROQ quality-data synchronization.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agroq-core";

/// Defect percentage at or below which a lot grades as excellent.
pub const EXCELLENT_MAX_DEFECTS: f64 = 2.0;
pub const GOOD_MAX_DEFECTS: f64 = 5.0;
pub const FAIR_MAX_DEFECTS: f64 = 10.0;
/// Exportable share at or above which a lot is approved outright.
pub const APPROVAL_MIN_EXPORTABLE: f64 = 90.0;

/// Overall quality grade. Serialized with the labels the rest of the platform stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityGrade {
    #[serde(rename = "excelente")]
    Excellent,
    #[serde(rename = "buena")]
    Good,
    #[serde(rename = "regular")]
    Fair,
    #[serde(rename = "mala")]
    Poor,
}

impl QualityGrade {
    /// Grade from the defect percentage; an unknown percentage grades as fair.
    pub fn from_defect_percentage(defect_percentage: Option<f64>) -> Self {
        match defect_percentage {
            Some(p) if p <= EXCELLENT_MAX_DEFECTS => Self::Excellent,
            Some(p) if p <= GOOD_MAX_DEFECTS => Self::Good,
            Some(p) if p <= FAIR_MAX_DEFECTS => Self::Fair,
            Some(_) => Self::Poor,
            None => Self::Fair,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excelente",
            Self::Good => "buena",
            Self::Fair => "regular",
            Self::Poor => "mala",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "excelente" => Some(Self::Excellent),
            "buena" => Some(Self::Good),
            "regular" => Some(Self::Fair),
            "mala" => Some(Self::Poor),
            _ => None,
        }
    }
}

/// Approval rule: a reported exportable share decides on its own; without one,
/// the lot is approved only when the defect percentage is known and at most 5%.
pub fn is_approved(exportable_percentage: Option<f64>, defect_percentage: Option<f64>) -> bool {
    match exportable_percentage {
        Some(exportable) => exportable >= APPROVAL_MIN_EXPORTABLE,
        None => defect_percentage.is_some_and(|p| p <= GOOD_MAX_DEFECTS),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub ph: Option<f64>,
    pub firmness: Option<f64>,
    pub soluble_solids: Option<f64>,
    pub titratable_acidity: Option<f64>,
}

impl Measurements {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.ph.is_none()
            && self.firmness.is_none()
            && self.soluble_solids.is_none()
            && self.titratable_acidity.is_none()
    }
}

/// Secondary fields kept for traceability. Values are carried as reported and
/// serialized under the platform's `additional_info` keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedAttributes {
    #[serde(rename = "destino")]
    pub destination: Option<JsonValue>,
    #[serde(rename = "variedad")]
    pub variety: Option<JsonValue>,
    #[serde(rename = "presentacion")]
    pub presentation: Option<JsonValue>,
    #[serde(rename = "tipo_caja")]
    pub box_type: Option<JsonValue>,
    #[serde(rename = "tipo_producto")]
    pub product_type: Option<JsonValue>,
    #[serde(rename = "trazabilidad")]
    pub traceability: Option<JsonValue>,
    #[serde(rename = "peso_muestra")]
    pub sample_weight_g: Option<JsonValue>,
    pub total_exportable: Option<JsonValue>,
    #[serde(rename = "total_no_exportable")]
    pub total_non_exportable: Option<JsonValue>,
    #[serde(rename = "total_condicion")]
    pub total_condition: Option<JsonValue>,
    #[serde(rename = "evaluador")]
    pub evaluator: Option<JsonValue>,
    #[serde(rename = "fundo")]
    pub farm: Option<JsonValue>,
    #[serde(rename = "linea")]
    pub line: Option<JsonValue>,
    #[serde(rename = "modulo")]
    pub module: Option<JsonValue>,
    #[serde(rename = "turno")]
    pub shift: Option<JsonValue>,
    #[serde(rename = "viaje")]
    pub trip: Option<JsonValue>,
    #[serde(rename = "semana")]
    pub week: Option<JsonValue>,
    #[serde(rename = "hora")]
    pub hour: Option<JsonValue>,
    #[serde(rename = "n_fcl")]
    pub container_number: Option<JsonValue>,
    #[serde(rename = "productor")]
    pub producer: Option<JsonValue>,
    #[serde(rename = "fecha_mp")]
    pub raw_material_date: Option<JsonValue>,
    #[serde(rename = "fecha_proceso")]
    pub process_date: Option<JsonValue>,
    pub record_id: Option<String>,
    pub row_index: Option<JsonValue>,
    pub processed_at: Option<JsonValue>,
}

/// Internal representation produced by the field mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedQualityRecord {
    pub company_label: String,
    pub recorded_at: DateTime<Utc>,
    pub measurements: Measurements,
    pub defect_percentage: Option<f64>,
    pub defect_description: String,
    pub caliber: String,
    pub color: String,
    pub quality_grade: QualityGrade,
    pub approved: bool,
    pub observations: String,
    pub extended_attributes: ExtendedAttributes,
    pub original_payload: JsonValue,
}

impl MappedQualityRecord {
    pub fn external_record_id(&self) -> Option<&str> {
        self.extended_attributes.record_id.as_deref()
    }

    /// Persisted JSON document: the untouched payload next to the secondary fields.
    pub fn processed_data(&self) -> JsonValue {
        json!({
            "original_data": self.original_payload,
            "additional_info": self.extended_attributes,
        })
    }
}

/// Row as held by a quality-record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredQualityRecord {
    pub id: Uuid,
    pub company_label: String,
    pub recorded_at: DateTime<Utc>,
    pub measurements: Measurements,
    pub defect_percentage: Option<f64>,
    pub defect_description: String,
    pub caliber: String,
    pub color: String,
    pub quality_grade: QualityGrade,
    pub approved: bool,
    pub observations: String,
    pub processed_data: JsonValue,
    pub created_by: Option<Uuid>,
    pub company_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredQualityRecord {
    pub fn create(
        company_label: &str,
        mapped: &MappedQualityRecord,
        created_by: Option<Uuid>,
        company_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_label: company_label.to_string(),
            recorded_at: mapped.recorded_at,
            measurements: mapped.measurements.clone(),
            defect_percentage: mapped.defect_percentage,
            defect_description: mapped.defect_description.clone(),
            caliber: mapped.caliber.clone(),
            color: mapped.color.clone(),
            quality_grade: mapped.quality_grade,
            approved: mapped.approved,
            observations: mapped.observations.clone(),
            processed_data: mapped.processed_data(),
            created_by,
            company_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite every mutable field. Identity, company link and creator stay as they are.
    pub fn apply(&mut self, mapped: &MappedQualityRecord, now: DateTime<Utc>) {
        self.recorded_at = mapped.recorded_at;
        self.measurements = mapped.measurements.clone();
        self.defect_percentage = mapped.defect_percentage;
        self.defect_description = mapped.defect_description.clone();
        self.caliber = mapped.caliber.clone();
        self.color = mapped.color.clone();
        self.quality_grade = mapped.quality_grade;
        self.approved = mapped.approved;
        self.observations = mapped.observations.clone();
        self.processed_data = mapped.processed_data();
        self.updated_at = now;
    }

    pub fn external_record_id(&self) -> Option<&str> {
        self.processed_data
            .get("additional_info")
            .and_then(|info| info.get("record_id"))
            .and_then(JsonValue::as_str)
    }
}

/// User attributed on records created by a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRef {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

/// Authenticated caller as seen by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub company: Option<CompanyRef>,
    pub is_admin: bool,
    pub is_manager: bool,
}

impl Principal {
    pub fn actor(&self) -> ActorRef {
        ActorRef {
            id: self.user_id,
            email: self.email.clone(),
        }
    }
}

/// Per-company sync outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub company_label: String,
    pub success: bool,
    pub message: String,
    pub records_processed: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_failed: usize,
}

impl SyncResult {
    pub fn failed(company_label: &str, message: impl Into<String>) -> Self {
        Self {
            company_label: company_label.to_string(),
            success: false,
            message: message.into(),
            records_processed: 0,
            records_created: 0,
            records_updated: 0,
            records_failed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub total_records: usize,
    pub approved_records: usize,
    pub rejected_records: usize,
    pub avg_temperature: Option<f64>,
    pub avg_humidity: Option<f64>,
    pub avg_ph: Option<f64>,
    pub grade_breakdown: BTreeMap<String, usize>,
    pub companies_count: usize,
}

impl QualityStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a StoredQualityRecord>) -> Self {
        let mut stats = Self::default();
        let mut temperature = Vec::new();
        let mut humidity = Vec::new();
        let mut ph = Vec::new();
        let mut companies = BTreeSet::new();

        for record in records {
            stats.total_records += 1;
            if record.approved {
                stats.approved_records += 1;
            }
            temperature.extend(record.measurements.temperature);
            humidity.extend(record.measurements.humidity);
            ph.extend(record.measurements.ph);
            *stats
                .grade_breakdown
                .entry(record.quality_grade.as_str().to_string())
                .or_default() += 1;
            companies.insert(record.company_label.as_str());
        }

        stats.rejected_records = stats.total_records - stats.approved_records;
        stats.avg_temperature = mean(&temperature);
        stats.avg_humidity = mean(&humidity);
        stats.avg_ph = mean(&ph);
        stats.companies_count = companies.len();
        stats
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mapped(defects: Option<f64>) -> MappedQualityRecord {
        MappedQualityRecord {
            company_label: "ACME".into(),
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            measurements: Measurements::default(),
            defect_percentage: defects,
            defect_description: String::new(),
            caliber: String::new(),
            color: String::new(),
            quality_grade: QualityGrade::from_defect_percentage(defects),
            approved: is_approved(None, defects),
            observations: String::new(),
            extended_attributes: ExtendedAttributes {
                record_id: Some("r-1".into()),
                ..Default::default()
            },
            original_payload: json!({"EMPRESA": "ACME"}),
        }
    }

    #[test]
    fn grade_thresholds_are_inclusive() {
        assert_eq!(QualityGrade::from_defect_percentage(Some(2.0)), QualityGrade::Excellent);
        assert_eq!(QualityGrade::from_defect_percentage(Some(2.01)), QualityGrade::Good);
        assert_eq!(QualityGrade::from_defect_percentage(Some(5.0)), QualityGrade::Good);
        assert_eq!(QualityGrade::from_defect_percentage(Some(10.0)), QualityGrade::Fair);
        assert_eq!(QualityGrade::from_defect_percentage(Some(10.5)), QualityGrade::Poor);
        assert_eq!(QualityGrade::from_defect_percentage(None), QualityGrade::Fair);
    }

    #[test]
    fn grade_labels_round_trip_through_parse() {
        for grade in [
            QualityGrade::Excellent,
            QualityGrade::Good,
            QualityGrade::Fair,
            QualityGrade::Poor,
        ] {
            assert_eq!(QualityGrade::parse(grade.as_str()), Some(grade));
        }
        assert_eq!(
            serde_json::to_value(QualityGrade::Good).unwrap(),
            json!("buena")
        );
    }

    #[test]
    fn exportable_share_overrides_defect_rule() {
        assert!(is_approved(Some(95.0), Some(40.0)));
        assert!(!is_approved(Some(89.9), Some(0.0)));
        assert!(is_approved(None, Some(5.0)));
        assert!(!is_approved(None, Some(5.1)));
        assert!(!is_approved(None, None));
    }

    #[test]
    fn processed_data_uses_platform_keys() {
        let mut record = mapped(Some(1.0));
        record.extended_attributes.destination = Some(json!("USA"));
        record.extended_attributes.sample_weight_g = Some(json!(125));
        record.extended_attributes.container_number = Some(json!("MSKU1234567"));
        record.extended_attributes.raw_material_date = Some(json!("2024-01-01"));

        let doc = record.processed_data();
        let info = &doc["additional_info"];
        assert_eq!(info["destino"], json!("USA"));
        assert_eq!(info["peso_muestra"], json!(125));
        assert_eq!(info["n_fcl"], json!("MSKU1234567"));
        assert_eq!(info["fecha_mp"], json!("2024-01-01"));
        assert_eq!(info["record_id"], json!("r-1"));
        assert!(info.get("destination").is_none());
        assert_eq!(doc["original_data"], json!({"EMPRESA": "ACME"}));

        let parsed: ExtendedAttributes = serde_json::from_value(info.clone()).unwrap();
        assert_eq!(parsed, record.extended_attributes);
    }

    #[test]
    fn apply_keeps_identity_and_creator() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().unwrap();
        let creator = Uuid::new_v4();
        let mut stored = StoredQualityRecord::create("ACME", &mapped(Some(1.0)), Some(creator), None, now);
        let id = stored.id;

        let later = now + chrono::Duration::hours(1);
        stored.apply(&mapped(Some(7.0)), later);

        assert_eq!(stored.id, id);
        assert_eq!(stored.created_by, Some(creator));
        assert_eq!(stored.created_at, now);
        assert_eq!(stored.updated_at, later);
        assert_eq!(stored.quality_grade, QualityGrade::Fair);
        assert_eq!(stored.external_record_id(), Some("r-1"));
    }

    #[test]
    fn stats_aggregate_counts_and_averages() {
        let now = Utc::now();
        let mut a = StoredQualityRecord::create("ACME", &mapped(Some(1.0)), None, None, now);
        a.measurements.temperature = Some(2.0);
        let mut b = StoredQualityRecord::create("OTHER", &mapped(Some(12.0)), None, None, now);
        b.measurements.temperature = Some(4.0);

        let stats = QualityStats::from_records([&a, &b]);
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.approved_records, 1);
        assert_eq!(stats.rejected_records, 1);
        assert_eq!(stats.avg_temperature, Some(3.0));
        assert_eq!(stats.avg_ph, None);
        assert_eq!(stats.grade_breakdown.get("excelente"), Some(&1));
        assert_eq!(stats.grade_breakdown.get("mala"), Some(&1));
        assert_eq!(stats.companies_count, 2);
    }
}
