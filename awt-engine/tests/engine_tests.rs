//! End-to-end engine runs against the simulation backend.

mod support;

use awt_common::db::models::ResultStatus;
use awt_common::db::{self, results};
use awt_engine::hardware::ColorReading;
use awt_engine::state::SystemStatus;
use support::*;

fn color(l: f64) -> ColorReading {
    ColorReading {
        l,
        a: 0.0,
        b: 0.0,
        rgb: (0, 0, 0),
    }
}

async fn result_for(db: &sqlx::SqlitePool, name: &str) -> awt_common::db::models::TestResult {
    results::recent_results(db, 50)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.test_name == name)
        .expect("result row for test")
}

#[tokio::test(start_paused = true)]
async fn direct_read_completes_and_drains_chamber() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "A", 10.0).await;
    seed_direct_sheet(&db, "PH-chart").await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "PH-chart"))
        .await
        .unwrap();

    let outcome = bench.engine.run_sequence("PH").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Completed);
    assert_eq!(outcome.value, Some(5.0));

    let row = result_for(&db, "PH").await;
    assert_eq!(row.status, ResultStatus::Completed);
    assert_eq!(row.value, Some(5.0));

    // Chamber prepared and drained, sensor re-baselined
    let journal = bench.device.journal();
    assert!(journal.contains(&"pump:MixerFill(Tank):5.00".to_string()));
    assert!(journal.contains(&"pump:MainDrain:6.00".to_string()));
    assert_eq!(bench.sensor.calibrations(), 1);

    // Inventory decremented by exactly the dosed amount
    let slot = db::reagents::get_slot(&db, "A").await.unwrap();
    assert!((slot.remaining_ml - 9.5).abs() < 1e-9);

    assert_eq!(bench.state.status().await, SystemStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn titration_finds_transition_at_1_2_ml() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "K", 20.0).await;
    seed_binary_sheet(&db, "KH-chart").await;
    seed_recent_result(&db).await;

    let mut ts = direct_read_test("KH-titration", "KH-chart");
    ts.reagent_steps.clear();
    ts.water_volume_ml = 0.0;
    ts.titration = Some(titration_spec("K", 2.0, 10.0));
    db::tests::upsert_test(&db, &ts).await.unwrap();

    // The matched value crosses the 0.5 transition once 1.2 mL went in:
    // read index equals dispensed centi-mL throughout both phases.
    bench
        .sensor
        .set_color_fn(|idx| if idx >= 120 { color(10.0) } else { color(0.0) });

    let outcome = bench.engine.run_sequence("KH-titration").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Completed);
    assert_eq!(outcome.value, Some(12.0));

    let row = result_for(&db, "KH-titration").await;
    assert_eq!(row.value, Some(12.0));
    let readings: Vec<serde_json::Value> =
        serde_json::from_str(row.readings_json.as_deref().unwrap()).unwrap();
    // 101 readings in the first 1 mL allotment, 20 more in the second
    assert_eq!(readings.len(), 121);
    assert_eq!(readings.last().unwrap()["dispensed_ml"], 1.2);

    // Inventory decremented by the dispensed-at-transition amount
    let slot = db::reagents::get_slot(&db, "K").await.unwrap();
    assert!((slot.remaining_ml - 18.8).abs() < 1e-9);

    // Unused second-phase reagent went back to its slot
    let journal = bench.device.journal();
    assert!(journal.contains(&"lower:ReagentReturn".to_string()));
}

#[tokio::test(start_paused = true)]
async fn titration_exhaustion_fails_and_persists_readings() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "K", 20.0).await;
    seed_binary_sheet(&db, "KH-chart").await;
    seed_recent_result(&db).await;

    let mut ts = direct_read_test("NO3-titration", "KH-chart");
    ts.reagent_steps.clear();
    ts.water_volume_ml = 0.0;
    ts.titration = Some(titration_spec("K", 0.1, 10.0));
    db::tests::upsert_test(&db, &ts).await.unwrap();

    // Never crosses the transition
    bench.sensor.set_color_fn(|_| color(0.0));

    let outcome = bench.engine.run_sequence("NO3-titration").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(outcome.value, None);

    let row = result_for(&db, "NO3-titration").await;
    assert_eq!(row.status, ResultStatus::Failed);
    assert_eq!(row.value, None);
    let readings: Vec<serde_json::Value> =
        serde_json::from_str(row.readings_json.as_deref().unwrap()).unwrap();
    assert_eq!(readings.len(), 11);

    assert_eq!(bench.alarm_count("Unable to Evaluate"), 1);

    let slot = db::reagents::get_slot(&db, "K").await.unwrap();
    assert!((slot.remaining_ml - 19.9).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn low_reagent_alarm_boundary() {
    // Exactly at the threshold after dosing: no alarm
    {
        let (_dir, db) = test_db().await;
        let bench = bench(&db).await;
        seed_slot(&db, "A", 5.5).await;
        seed_direct_sheet(&db, "chart").await;
        db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
            .await
            .unwrap();

        bench.engine.run_sequence("PH").await.unwrap();
        let slot = db::reagents::get_slot(&db, "A").await.unwrap();
        assert!((slot.remaining_ml - 5.0).abs() < 1e-9);
        assert_eq!(bench.alarm_count("Reagent in Slot"), 0);
    }
    // A hundredth below: alarm
    {
        let (_dir, db) = test_db().await;
        let bench = bench(&db).await;
        seed_slot(&db, "A", 5.49).await;
        seed_direct_sheet(&db, "chart").await;
        db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
            .await
            .unwrap();

        bench.engine.run_sequence("PH").await.unwrap();
        assert_eq!(bench.alarm_count("Reagent in Slot"), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn low_result_fires_alarm_and_suppresses_warning() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "A", 10.0).await;
    seed_direct_sheet(&db, "chart").await;
    let mut ts = direct_read_test("PH", "chart");
    // Matched value is 5.0: under both low bounds
    ts.too_low_alarm = Some(6.0);
    ts.too_low_warning = Some(7.0);
    db::tests::upsert_test(&db, &ts).await.unwrap();

    bench.engine.run_sequence("PH").await.unwrap();
    assert_eq!(bench.alarm_count("What: Alarm"), 1);
    assert_eq!(bench.alarm_count("What: Warning"), 0);
}

#[tokio::test(start_paused = true)]
async fn high_warning_fires_without_alarm_bound() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "A", 10.0).await;
    seed_direct_sheet(&db, "chart").await;
    let mut ts = direct_read_test("PH", "chart");
    ts.too_high_warning = Some(4.0);
    db::tests::upsert_test(&db, &ts).await.unwrap();

    bench.engine.run_sequence("PH").await.unwrap();
    assert_eq!(bench.alarm_count("What: Warning"), 1);
    assert_eq!(bench.alarm_count("What: Alarm"), 0);
}

#[tokio::test(start_paused = true)]
async fn preflight_low_inventory_blocks_without_hardware() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    // Below the 5.0 mL threshold before the run starts
    seed_slot(&db, "A", 2.0).await;
    seed_direct_sheet(&db, "chart").await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
        .await
        .unwrap();

    let outcome = bench.engine.run_sequence("PH").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(bench.alarm_count("Reagent in Slot"), 1);

    // Homed, but never moved or dosed
    let journal = bench.device.journal();
    assert!(!journal.iter().any(|op| op.starts_with("move:")));
    assert!(!journal.iter().any(|op| op.starts_with("withdraw:")));

    // Inventory untouched
    let slot = db::reagents::get_slot(&db, "A").await.unwrap();
    assert!((slot.remaining_ml - 2.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn abort_between_steps_skips_rest_but_cleans_up() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "A", 10.0).await;
    seed_slot(&db, "B", 10.0).await;
    seed_direct_sheet(&db, "chart").await;
    seed_recent_result(&db).await;

    let mut ts = direct_read_test("two-step", "chart");
    ts.reagent_steps = vec![step("A", 0.5), step("B", 0.5)];
    db::tests::upsert_test(&db, &ts).await.unwrap();

    // Step 1 ends with its syringe clean cycle; the 4th dispense of the
    // run is the clean cycle's air purge. Abort right there, before
    // step 2 starts.
    let state = bench.state.clone();
    let mut dispenses = 0;
    bench.device.set_hook(move |op| {
        if op == "dispense" {
            dispenses += 1;
            if dispenses == 4 {
                state.request_abort();
            }
        }
    });

    let outcome = bench.engine.run_sequence("two-step").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Aborted);
    assert_eq!(outcome.value, None);

    let row = result_for(&db, "two-step").await;
    assert_eq!(row.status, ResultStatus::Aborted);

    let journal = bench.device.journal();
    // Step 2's reagent was never visited, no measurement happened
    assert!(!journal.contains(&"move:B".to_string()));
    assert_eq!(bench.sensor.color_reads(), 0);
    // Cleanup still ran: osmosis mixer clean plus final homing
    assert!(journal.contains(&"pump:MixerFill(Osmosis):8.00".to_string()));
    assert_eq!(journal.iter().filter(|op| *op == "home").count(), 2);

    assert_eq!(bench.state.status().await, SystemStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn step_hardware_failure_aborts_with_rotate_alarm() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "A", 10.0).await;
    seed_direct_sheet(&db, "chart").await;
    seed_recent_result(&db).await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
        .await
        .unwrap();

    bench.device.fail_on("lower");

    let outcome = bench.engine.run_sequence("PH").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(bench.alarm_count("Unable to Rotate"), 1);
    // Measurement never ran
    assert_eq!(bench.sensor.color_reads(), 0);
}

#[tokio::test(start_paused = true)]
async fn kh_test_fast_then_fine_doses_to_endpoint() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "K", 100.0).await;

    let mut ts = direct_read_test("KH", "unused");
    ts.reagent_steps.clear();
    ts.kh_probe_test = true;
    ts.color_chart = None;
    ts.water_volume_ml = 40.0;
    ts.titration = Some(titration_spec("K", 5.0, 1.2));
    db::tests::upsert_test(&db, &ts).await.unwrap();

    // 7.5 start, three fast doses down to 5.5, two fine doses to 4.4
    bench.sensor.push_ph([7.5, 7.0, 6.0, 5.5, 5.0, 4.4]);

    let outcome = bench.engine.run_sequence("KH").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Completed);
    // 3 x 0.50 + 2 x 0.05 = 1.60 mL, scaled by 1.2
    assert_eq!(outcome.value, Some(1.92));

    let reagent_doses = bench
        .device
        .journal()
        .iter()
        .filter(|op| op.starts_with("pump:KhReagent"))
        .count();
    assert_eq!(reagent_doses, 5);

    let slot = db::reagents::get_slot(&db, "K").await.unwrap();
    assert!((slot.remaining_ml - 98.4).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn kh_test_rejects_out_of_window_start_before_dosing() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "K", 100.0).await;

    let mut ts = direct_read_test("KH", "unused");
    ts.reagent_steps.clear();
    ts.kh_probe_test = true;
    ts.color_chart = None;
    ts.titration = Some(titration_spec("K", 5.0, 1.2));
    db::tests::upsert_test(&db, &ts).await.unwrap();

    bench.sensor.push_ph([9.5]);

    let outcome = bench.engine.run_sequence("KH").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(bench.alarm_count("Unable to Evaluate"), 1);

    // No reagent was spent
    assert!(!bench
        .device
        .journal()
        .iter()
        .any(|op| op.starts_with("pump:KhReagent")));
    let slot = db::reagents::get_slot(&db, "K").await.unwrap();
    assert!((slot.remaining_ml - 100.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn kh_preflight_uses_kh_threshold() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    // Plenty for a carousel test, under the 50 mL KH threshold
    seed_slot(&db, "K", 10.0).await;

    let mut ts = direct_read_test("KH", "unused");
    ts.reagent_steps.clear();
    ts.kh_probe_test = true;
    ts.color_chart = None;
    ts.titration = Some(titration_spec("K", 5.0, 1.2));
    db::tests::upsert_test(&db, &ts).await.unwrap();

    let outcome = bench.engine.run_sequence("KH").await.unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(bench.alarm_count("Reagent in Slot"), 1);
    // No pump ever ran; the only journal entry is the terminal
    // agitator-off safety.
    assert_eq!(bench.device.count_op("pump"), 0);
}

#[tokio::test(start_paused = true)]
async fn every_run_produces_exactly_one_result() {
    let (_dir, db) = test_db().await;
    let bench = bench(&db).await;
    seed_slot(&db, "A", 10.0).await;
    seed_direct_sheet(&db, "chart").await;
    db::tests::upsert_test(&db, &direct_read_test("PH", "chart"))
        .await
        .unwrap();

    bench.engine.run_sequence("PH").await.unwrap();
    bench.engine.run_sequence("PH").await.unwrap();
    // A missing definition still records its attempt
    bench.engine.run_sequence("no-such-test").await.unwrap();

    let rows = results::recent_results(&db, 50).await.unwrap();
    assert_eq!(rows.iter().filter(|r| r.test_name == "PH").count(), 2);
    assert_eq!(
        rows.iter()
            .filter(|r| r.test_name == "no-such-test")
            .count(),
        1
    );
}
