use chrono::NaiveDate;
use healthlake::{
    add_calendar_features, build_ring_daily_table, join_ring_daily, melt, normalize_entries,
    pivot, read_export, Cell, ColumnKey, IngestConfig, JoinConfig, JsonRecord, NormalizeConfig,
    PivotError, RuleError, RuleTable,
};
use serde_json::json;

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).expect("valid test date")
}

fn record(value: serde_json::Value) -> JsonRecord {
    value.as_object().cloned().expect("object")
}

const EXPORT: &str = "\
Date,Category,Detail,Rating/Amount,Notes
\"5th Jan, 2025\",Symptom,Headache (Mild),2,
\"5th Jan, 2025\",Symptom,Headache (Severe),4,
\"5th Jan, 2025\",Energy,Energy,2,
\"5th Jan, 2025\",Energy,Energy,5,
\"5th Jan, 2025\",Bowel Movements,Type 4,,
\"5th Jan, 2025\",Bowel Movements,Type 3,,
\"5th Jan, 2025\",Gratitudes,Family,,
\"6th Jan, 2025\",Med/Supplements,Magnesium 🌙,,
\"6th Jan, 2025\",Nutrition,Sugar - A Lot | Protein - Little,,
";

#[test]
fn default_rules_cover_every_mode() {
    let batch = read_export(EXPORT.as_bytes(), &IngestConfig::default()).expect("export");
    let (entries, report) = normalize_entries(
        &batch.entries,
        &RuleTable::bearable_default(),
        &NormalizeConfig::default(),
    )
    .expect("normalize");

    assert_eq!(report.removed_rows, 1);
    assert_eq!(report.undated_rows, 0);

    let wide = pivot(&entries).expect("pivot");
    let headache = ColumnKey::new("Symptom", "Headache");
    let energy = ColumnKey::new("Energy", "Energy");
    let bowel = ColumnKey::new("Bowel Movements", "Number_Bowel_Movements");
    let sugar = ColumnKey::new("Nutrition", "Sugar");
    let protein = ColumnKey::new("Nutrition", "Protein");

    assert_eq!(wide.value(date(5), &headache), Some(2.0));
    assert_eq!(wide.value(date(5), &energy), Some(3.5));
    assert_eq!(wide.value(date(5), &bowel), Some(2.0));
    assert_eq!(wide.value(date(6), &sugar), Some(3.0));
    assert_eq!(wide.value(date(6), &protein), Some(1.0));
    assert_eq!(wide.value(date(6), &headache), Some(0.0));
    assert!(!wide.column_names().iter().any(|name| name.starts_with("Gratitudes")));
    assert!(wide
        .column_names()
        .iter()
        .any(|name| name == "Med/Supplements_Magnesium 🌙"));
}

#[test]
fn melt_recovers_every_nonzero_cell() {
    let batch = read_export(EXPORT.as_bytes(), &IngestConfig::default()).expect("export");
    let (entries, _) = normalize_entries(
        &batch.entries,
        &RuleTable::bearable_default(),
        &NormalizeConfig::default(),
    )
    .expect("normalize");
    let wide = pivot(&entries).expect("pivot");

    let melted = melt(&wide);
    let nonzero = melted.iter().filter(|entry| entry.value != 0.0).count();
    assert_eq!(nonzero, entries.len());
    assert_eq!(pivot(&melted).expect("re-pivot"), wide);
}

#[test]
fn rules_load_from_json_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rules.json");
    std::fs::write(
        &path,
        r#"[
            {"category": "Mood", "mode": "energy_mood"},
            {"category": "Chores", "mode": "map", "factors": {"Dishes": {"None": 0, "All": 2}}},
            {"category": "Noise", "mode": "remove"}
        ]"#,
    )
    .expect("write rules");

    let rules = RuleTable::from_path(&path).expect("rules");
    assert_eq!(rules.len(), 3);

    let csv = "date,category,detail,rating/amount,notes\n\
               2025-01-03,Chores,Dishes - All,,\n\
               2025-01-03,Noise,Traffic,,\n\
               2025-01-03,Mood,Mood,4,\n";
    let batch = read_export(csv.as_bytes(), &IngestConfig::default()).expect("export");
    let (entries, report) =
        normalize_entries(&batch.entries, &rules, &NormalizeConfig::default()).expect("normalize");
    let wide = pivot(&entries).expect("pivot");

    assert_eq!(wide.column_names(), vec!["Chores_Dishes", "Mood_Mood"]);
    assert_eq!(report.removed_rows, 1);

    std::fs::write(
        &path,
        r#"[{"category": "Mood", "mode": "preserve"}, {"category": "Mood", "mode": "remove"}]"#,
    )
    .expect("write rules");
    assert!(matches!(
        RuleTable::from_path(&path),
        Err(RuleError::DuplicateCategory(_))
    ));
}

#[test]
fn display_name_collisions_are_fatal() {
    let csv = "date,category,detail,rating/amount,notes\n\
               2025-01-03,Med,Supplements_Zinc,1,\n\
               2025-01-03,Med_Supplements,Zinc,1,\n";
    let batch = read_export(csv.as_bytes(), &IngestConfig::default()).expect("export");
    let (entries, _) = normalize_entries(
        &batch.entries,
        &RuleTable::bearable_default(),
        &NormalizeConfig::default(),
    )
    .expect("lenient normalize");

    let err = pivot(&entries).expect_err("collision");
    assert!(matches!(err, PivotError::ColumnNameCollision { ref name, .. } if name == "Med_Supplements_Zinc"));
}

#[test]
fn shaped_ring_rows_join_the_previous_journal_day() {
    let csv = "date,category,detail,rating/amount,notes\n\
               10th Jan 2025,Mood,Mood,4,\n\
               11th Jan 2025,Mood,Mood,3,\n";
    let batch = read_export(csv.as_bytes(), &IngestConfig::default()).expect("export");
    let (entries, _) = normalize_entries(
        &batch.entries,
        &RuleTable::bearable_default(),
        &NormalizeConfig::default(),
    )
    .expect("normalize");
    let daily = add_calendar_features(&pivot(&entries).expect("pivot").to_table());

    let ring = build_ring_daily_table(
        &[record(json!({"id": "d", "day": "2025-01-11", "score": 81, "contributors": {"rem_sleep": 60}}))],
        &[
            record(json!({"id": "s1", "day": "2025-01-11", "type": "long_sleep", "efficiency": 92})),
            record(json!({"id": "s2", "day": "2025-01-11", "type": "sleep", "efficiency": 50})),
        ],
        &[],
    );
    assert_eq!(ring.table.len(), 2);

    let (joined, report) =
        join_ring_daily(&daily, &ring.table, &JoinConfig::default()).expect("join");

    assert_eq!(joined.len(), 2);
    assert_eq!(joined.cell(0, "date"), Some(&Cell::Date(date(10))));
    assert_eq!(joined.cell(0, "efficiency"), Some(&Cell::Integer(92)));
    assert_eq!(joined.cell(0, "daily_sleep_score"), Some(&Cell::Integer(81)));
    assert_eq!(joined.cell(0, "daily_sleep_rem_sleep"), Some(&Cell::Integer(60)));
    assert_eq!(joined.cell(1, "efficiency"), Some(&Cell::Null));
    assert_eq!(report.matched_rows, 1);
    assert!(!joined.has_column("day_minus_one"));
}

#[test]
fn pictograph_only_map_detail_becomes_category_column() {
    let csv = "date,category,detail,rating/amount,notes\n\
               2025-01-03,Creative,🎨,,\n\
               2025-01-03,Mood,Mood,3,\n";
    let batch = read_export(csv.as_bytes(), &IngestConfig::default()).expect("export");
    let (entries, _) = normalize_entries(
        &batch.entries,
        &RuleTable::bearable_default(),
        &NormalizeConfig::default(),
    )
    .expect("normalize");
    let wide = pivot(&entries).expect("pivot");

    assert_eq!(wide.column_names(), vec!["Creative_", "Mood_Mood"]);
    assert_eq!(wide.value(date(3), &ColumnKey::new("Creative", "")), Some(1.0));
}
