use chrono::NaiveDate;
use portfolio_history_builder::attribution::contributions;
use portfolio_history_builder::engine::{entity_values, group_by_entity, portfolio_values};
use portfolio_history_builder::returns::mom_return;
use portfolio_history_builder::risk::drawdown_series;
use portfolio_history_builder::utils::months_in_range;
use portfolio_history_builder::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

fn ym(y: i32, m: u32) -> YearMonth {
    YearMonth::new(y, m).unwrap()
}

fn record(platform: &str, asset: &str, value: f64, date: NaiveDate) -> SnapshotRecord {
    SnapshotRecord {
        platform: platform.to_string(),
        asset_name: asset.to_string(),
        asset_type: AssetType::Investments,
        value,
        timestamp: date,
        token_amount: None,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn seeded_config() -> DashboardConfig {
    let mut config = DashboardConfig::default();
    config.source_id = "household-sheet".to_string();
    config.forecast.seed = Some(42);
    config
        .classification
        .platform_rules
        .insert("Monzo".to_string(), AssetType::Cash);
    config.classification.substring_rules.push(SubstringRule {
        pattern: "sipp".to_string(),
        asset_type: AssetType::Pensions,
    });
    config.classification.substring_rules.push(SubstringRule {
        pattern: "isa".to_string(),
        asset_type: AssetType::Investments,
    });
    config
}

#[test]
fn test_latest_record_wins_and_gap_is_imputed() {
    let records = vec![
        record("P", "A", 100.0, date(2024, 1, 5)),
        record("P", "A", 110.0, date(2024, 1, 20)),
        record("P", "A", 120.0, date(2024, 3, 10)),
    ];
    let points = normalize(&records, &NormalizationConfig::default());

    let summary: Vec<(YearMonth, f64, bool)> = points
        .iter()
        .map(|p| (p.year_month, p.value, p.is_imputed))
        .collect();
    assert_eq!(
        summary,
        vec![
            (ym(2024, 1), 110.0, false),
            (ym(2024, 2), 110.0, true),
            (ym(2024, 3), 120.0, false),
        ]
    );

    let values = portfolio_values(&build_portfolio_snapshots(&points));
    assert_eq!(mom_return(&values, ym(2024, 2)), MetricValue::Defined(0.0));
    let march = mom_return(&values, ym(2024, 3)).value().unwrap();
    assert!((march - 0.0909).abs() < 1e-4);
}

#[test]
fn test_single_point_portfolio_has_only_tpv() -> anyhow::Result<()> {
    let source = InMemorySource::new("single").with_table(RawTable::new(
        "Balance Sheet",
        &["Platform", "Asset", "Value", "Timestamp"],
        &[&["Vanguard", "Stocks ISA", "£2,500.00", "15/06/2024"]],
    ));
    let bundle = process_portfolio_history(seeded_config(), Arc::new(source))?;

    let june = ym(2024, 6);
    let record = &bundle.portfolio_metrics[&june];
    assert_eq!(record["tpv"], MetricValue::Defined(2500.0));
    assert_eq!(record["drawdown"], MetricValue::Defined(0.0));

    for (name, value) in record {
        if name == "tpv" || name == "drawdown" {
            continue;
        }
        assert!(!value.is_defined(), "{} should be undefined, got {:?}", name, value);
    }

    assert!(bundle.forecasts.monte_carlo.is_err());
    assert!(bundle.seasonality.is_err());
    assert_eq!(bundle.risk.observations, 0);
    Ok(())
}

#[test]
fn test_offsetting_entities_leave_portfolio_flat() {
    let records = vec![
        record("P", "Up", 100.0, date(2024, 1, 31)),
        record("P", "Down", 100.0, date(2024, 1, 31)),
        record("P", "Up", 110.0, date(2024, 2, 29)),
        record("P", "Down", 90.0, date(2024, 2, 29)),
    ];
    let points = normalize(&records, &NormalizationConfig::default());
    let values = portfolio_values(&build_portfolio_snapshots(&points));
    assert_eq!(mom_return(&values, ym(2024, 2)), MetricValue::Defined(0.0));

    let breakdown = contributions(&entity_values(&points), ym(2024, 2)).unwrap();
    assert!(breakdown.portfolio_return.abs() < 1e-12);
    assert!(breakdown.reconciles(1e-9));
    let returns: Vec<f64> = breakdown
        .entities
        .iter()
        .filter_map(|c| c.asset_return.value())
        .collect();
    assert_eq!(returns.len(), 2);
    assert!(returns.iter().any(|r| (r + 0.1).abs() < 1e-12));
    assert!(returns.iter().any(|r| (r - 0.1).abs() < 1e-12));
}

#[test]
fn test_full_pipeline_with_extension_feeds() -> anyhow::Result<()> {
    let source = InMemorySource::new("household-sheet")
        .with_table(RawTable::new(
            "Balance Sheet",
            &["Platform", "Asset", "Value", "Timestamp", "Token Amount"],
            &[
                &["Monzo", "Current Account", "1,000", "2023-12-31", ""],
                &["Monzo", "Current Account", "1,100", "2024-01-31", ""],
                &["Monzo", "Current Account", "1,050", "2024-02-29", ""],
                &["Wahed", "SIPP", "5,000", "2023-12-15", ""],
                &["Wahed", "SIPP", "5,600", "2024-02-15", ""],
                &["Kraken", "BTC", "700", "2024-01-10", "0.02"],
                &["Kraken", "BTC", "oops", "2024-02-10", "0.02"],
            ],
        ))
        .with_table(RawTable::new(
            "Pension Cashflows",
            &["Platform", "Asset", "Value", "Timestamp", "Cashflow Type", "Description"],
            &[
                &["Wahed", "SIPP", "4,800", "2023-12-01", "Transfer", "Opening transfer"],
                &["Wahed", "SIPP", "300", "2024-01-01", "Contribution", ""],
                &["Wahed", "SIPP", "12", "2024-02-01", "Fee", "Platform fee"],
            ],
        ))
        .with_table(RawTable::new(
            "Car Assets",
            &["Timestamp", "Asset", "Car_Value", "Loan_Balance", "Loan_Status", "Mileage"],
            &[
                &["2023-12-31", "Golf", "18,000", "9,000", "Financed", "20000"],
                &["2024-02-29", "Golf", "17,400", "8,400", "Financed", "21500"],
            ],
        ));

    let processor = PortfolioHistoryProcessor::new(seeded_config())?;
    let data = processor.load(Arc::new(source))?;
    assert_eq!(data.load_reports.len(), 3);
    assert_eq!(data.load_reports[0].rows_dropped, 1);

    let bundle = processor.analyze(&data, None)?;
    assert_eq!(bundle.range, Some((ym(2023, 12), ym(2024, 2))));

    // Kraken is unmapped and warned about once
    assert_eq!(bundle.classification.unmapped_pairs, vec![EntityId::new("Kraken", "BTC")]);

    let feb = bundle.snapshots.last().unwrap();
    assert_eq!(feb.subtotal(AssetType::Pensions), 5600.0);
    assert_eq!(feb.subtotal(AssetType::Cash), 1050.0);
    // Kraken exits after January under the default policy
    assert_eq!(feb.subtotal(AssetType::Other), 0.0);
    assert_eq!(feb.total_value, 6650.0);

    let jan_sipp = bundle
        .points
        .iter()
        .find(|p| p.entity_id.asset_name == "SIPP" && p.year_month == ym(2024, 1))
        .unwrap();
    assert!(jan_sipp.is_imputed);
    assert_eq!(jan_sipp.value, 5000.0);

    for breakdown in bundle.contributions.values() {
        assert!(breakdown.reconciles(1e-9));
    }

    assert_eq!(bundle.pensions.len(), 1);
    let sipp = &bundle.pensions[0];
    assert_eq!(sipp.net_contributions, 4800.0 + 300.0 - 12.0);
    assert_eq!(sipp.investment_growth, MetricValue::Defined(5600.0 - 5088.0));

    assert_eq!(bundle.fleet.vehicles.len(), 1);
    assert_eq!(bundle.fleet.total_equity, 9000.0);
    assert_eq!(bundle.fleet.vehicles[0].depreciation, 600.0);

    assert_eq!(bundle.register.total_entries(), 3);
    assert!(bundle.to_json()?.contains("household-sheet"));
    Ok(())
}

#[test]
fn test_csv_source_round_trip() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!(
        "portfolio_history_builder_{}_balance.csv",
        std::process::id()
    ));
    {
        let mut file = File::create(&path)?;
        writeln!(file, "Timestamp,Platform,Asset,Value")?;
        writeln!(file, "2024-01-31,Monzo,Current Account,\"£1,000.00\"")?;
        writeln!(file, "2024-03-31,Monzo,Current Account,\"£1,200.00\"")?;
        writeln!(file, "not a date,Monzo,Current Account,5")?;
    }

    let source = CsvSource::new("csv").with_file("Balance Sheet", &path);
    let bundle = process_portfolio_history(seeded_config(), Arc::new(source));
    std::fs::remove_file(&path)?;
    let bundle = bundle?;

    assert_eq!(bundle.load_reports[0].rows_read, 3);
    assert_eq!(bundle.load_reports[0].rows_dropped, 1);
    assert_eq!(bundle.snapshots.len(), 3);
    assert_eq!(bundle.snapshots[1].imputed_count, 1);
    assert_eq!(bundle.snapshots[1].total_value, 1000.0);
    Ok(())
}

#[test]
fn test_csv_row_with_bad_encoding_is_dropped_not_fatal() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!(
        "portfolio_history_builder_{}_encoding.csv",
        std::process::id()
    ));
    {
        let mut file = File::create(&path)?;
        file.write_all(b"Timestamp,Platform,Asset,Value \n")?;
        file.write_all(b"2024-01-31,Monzo,Current Account,100\n")?;
        file.write_all(b"2024-02-29,Mon\xffzo,Current Account,105\n")?;
        file.write_all(b"2024-03-31,Monzo,Current Account,120\n")?;
    }

    let source = CsvSource::new("csv").with_file("Balance Sheet", &path);
    let bundle = process_portfolio_history(seeded_config(), Arc::new(source));
    std::fs::remove_file(&path)?;
    let bundle = bundle?;

    let report = &bundle.load_reports[0];
    assert_eq!(report.rows_read, 3);
    assert_eq!(report.rows_kept, 2);
    assert_eq!(report.rows_dropped, 1);
    assert!(matches!(report.warnings[0].kind, WarningKind::InvalidEncoding(_)));
    assert_eq!(report.warnings[0].row, 1);

    // the dropped February reading is imputed from January
    assert_eq!(bundle.snapshots.len(), 3);
    assert_eq!(bundle.snapshots[1].total_value, 100.0);
    assert_eq!(bundle.snapshots[1].imputed_count, 1);
    Ok(())
}

#[test]
fn test_allowed_values_warn_on_extension_feeds() -> anyhow::Result<()> {
    let mut config = seeded_config();
    config.loader.allowed_values.insert(
        "Pension Cashflows".to_string(),
        AllowedValues::from([(
            "Cashflow Type".to_string(),
            vec!["Contribution".to_string(), "Fee".to_string(), "Transfer".to_string()],
        )]),
    );

    let source = InMemorySource::new("sheet")
        .with_table(RawTable::new(
            "Balance Sheet",
            &["Platform", "Asset", "Value", "Timestamp"],
            &[&["Wahed", "SIPP", "1,000", "2024-01-31"]],
        ))
        .with_table(RawTable::new(
            "Pension Cashflows",
            &["Platform", "Asset", "Value", "Timestamp", "Cashflow Type"],
            &[
                &["Wahed", "SIPP", "900", "2024-01-01", "Transfer"],
                &["Wahed", "SIPP", "50", "2024-01-15", "Bonus"],
            ],
        ));

    let processor = PortfolioHistoryProcessor::new(config)?;
    let data = processor.load(Arc::new(source))?;
    let cashflow_report = &data.load_reports[1];
    assert_eq!(cashflow_report.table, "Pension Cashflows");
    assert_eq!(cashflow_report.rows_kept, 2);
    assert_eq!(
        cashflow_report.warnings[0].kind,
        WarningKind::UnexpectedValue("Bonus".to_string())
    );
    assert!(!data.load_reports[0].has_warnings());
    Ok(())
}

#[test]
fn test_missing_required_column_is_fatal() {
    let source = InMemorySource::new("broken").with_table(RawTable::new(
        "Balance Sheet",
        &["Platform", "Asset", "Timestamp"],
        &[&["Monzo", "Current Account", "2024-01-31"]],
    ));
    let result = process_portfolio_history(seeded_config(), Arc::new(source));
    match result {
        Err(PortfolioError::SchemaMismatch { missing, .. }) => {
            assert_eq!(missing, vec!["Value".to_string()]);
        }
        other => panic!("expected schema mismatch, got {:?}", other.map(|b| b.range)),
    }
}

#[test]
fn test_config_json_round_trip() -> anyhow::Result<()> {
    let json = r#"{
        "source_id": "sheet-1",
        "classification": {
            "platform_rules": { "IBKR": "Investments" },
            "substring_rules": [ { "pattern": "pension", "asset_type": "Pensions" } ],
            "required_types": ["Investments", "Pensions"]
        },
        "metrics": { "rolling_windows": [6, 12] },
        "forecast": { "paths": 200, "seed": 9, "sampling": "fitted_normal" }
    }"#;
    let config = DashboardConfig::from_json_str(json)?;
    assert_eq!(config.metrics.rolling_windows, vec![6, 12]);
    assert_eq!(config.forecast.sampling, SamplingMethod::FittedNormal);
    assert_eq!(config.normalization.forward_fill, ForwardFillPolicy::StopAtLastObservation);

    let bad = r#"{ "classification": { "required_types": ["Vehicle"] }, "loader": { "timeout_seconds": 0 } }"#;
    match DashboardConfig::from_json_str(bad) {
        Err(PortfolioError::InvalidConfig(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected invalid config, got {:?}", other.map(|c| c.source_id)),
    }

    let schema = DashboardConfig::schema_as_json()?;
    assert!(schema.contains("rolling_windows"));
    Ok(())
}

#[test]
fn test_forecast_is_reproducible_with_seed() {
    let start = ym(2021, 1);
    let mut value = 10_000.0;
    let values: MonthlyValues = (0..36)
        .map(|i| {
            value *= if i % 4 == 0 { 0.97 } else { 1.02 };
            (start.plus_months(i), value)
        })
        .collect();

    let params = ForecastParams {
        paths: 500,
        seed: Some(3),
        ..Default::default()
    };
    let a = monte_carlo_seeded(&values, &params, 3).unwrap();
    let b = monte_carlo_seeded(&values, &params, 3).unwrap();
    assert_eq!(a.bands, b.bands);
    assert_eq!(a.bands.len(), 12);
    assert_eq!(a.start_month, ym(2023, 12));

    let c = monte_carlo_seeded(&values, &params, 4).unwrap();
    assert_ne!(a.bands, c.bands);
}

fn record_strategy() -> impl Strategy<Value = SnapshotRecord> {
    (0usize..3, 0u32..24, 1u32..29, 1.0f64..10_000.0).prop_map(|(entity, offset, day, value)| {
        let month = ym(2022, 1).plus_months(offset);
        record(
            &format!("Platform {}", entity),
            "Holding",
            value,
            date(month.year(), month.month(), day),
        )
    })
}

proptest! {
    #[test]
    fn prop_grid_is_unique_and_complete(records in prop::collection::vec(record_strategy(), 1..40)) {
        let points = normalize(&records, &NormalizationConfig::default());

        let mut seen = BTreeSet::new();
        for p in &points {
            prop_assert!(seen.insert((p.entity_id.clone(), p.year_month)));
        }

        let mut observed: BTreeMap<EntityId, Vec<YearMonth>> = BTreeMap::new();
        for r in &records {
            observed.entry(r.entity_id()).or_default().push(r.year_month());
        }

        let grouped = group_by_entity(&points);
        for (entity, months) in observed {
            let first = *months.iter().min().unwrap();
            let last = *months.iter().max().unwrap();
            let emitted: Vec<YearMonth> = grouped[&entity].iter().map(|p| p.year_month).collect();
            prop_assert_eq!(emitted, months_in_range(first, last));
        }
    }

    #[test]
    fn prop_imputed_points_carry_prior_observation(records in prop::collection::vec(record_strategy(), 1..40)) {
        let points = normalize(&records, &NormalizationConfig::default());
        for series in group_by_entity(&points).values() {
            prop_assert!(!series[0].is_imputed);
            let mut last_real = series[0].value;
            for p in series {
                if p.is_imputed {
                    prop_assert_eq!(p.value, last_real);
                } else {
                    last_real = p.value;
                }
            }
        }
    }

    #[test]
    fn prop_renormalizing_is_idempotent(records in prop::collection::vec(record_strategy(), 1..40)) {
        let normalizer = Normalizer::default();
        let first = normalizer.normalize(&records);
        let second = normalizer.normalize(&to_snapshot_records(&first));

        prop_assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            prop_assert_eq!(&a.entity_id, &b.entity_id);
            prop_assert_eq!(a.year_month, b.year_month);
            prop_assert_eq!(a.value, b.value);
            prop_assert_eq!(a.months_held, b.months_held);
        }
    }

    #[test]
    fn prop_drawdown_is_never_positive(raw in prop::collection::vec(1.0f64..1_000.0, 1..36)) {
        let start = ym(2020, 1);
        let values: MonthlyValues = raw
            .iter()
            .enumerate()
            .map(|(i, v)| (start.plus_months(i as u32), *v))
            .collect();

        let mut peak = f64::NEG_INFINITY;
        for (month, dd) in drawdown_series(&values) {
            let value = values[&month];
            peak = peak.max(value);
            let dd = dd.value().unwrap();
            prop_assert!(dd <= 0.0);
            if value == peak {
                prop_assert_eq!(dd, 0.0);
            }
        }
    }

    #[test]
    fn prop_contributions_sum_to_portfolio_return(records in prop::collection::vec(record_strategy(), 1..40)) {
        let points = normalize(&records, &NormalizationConfig::default());
        let totals = portfolio_values(&build_portfolio_snapshots(&points));
        let entities = entity_values(&points);

        for month in totals.keys() {
            if let Ok(breakdown) = contributions(&entities, *month) {
                prop_assert!(breakdown.reconciles(1e-6));
                if let Some(r) = mom_return(&totals, *month).value() {
                    prop_assert!((breakdown.portfolio_return - r).abs() < 1e-9);
                }
            }
        }
    }
}
