use eval_store::error::StoreError;
use eval_store::evaluation::db::EvalDb;
use eval_store::evaluation::record::{CreateOptions, LEGACY_VERSION, NORMALIZED_VERSION};
use eval_store::evaluation::stats::get_eval_summaries;
use eval_store::evaluation::{
    Eval, EvalResults, EvaluateResult, EvaluateSummary, Outcome, Prompt, ResultsFile, UnifiedConfig,
};
use eval_store::settings::RuntimePolicy;
use serde_json::json;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn config_with_tests(n: usize) -> UnifiedConfig {
    let tests: Vec<_> = (0..n).map(|i| json!({"vars": {"i": i}})).collect();
    UnifiedConfig {
        description: Some("smoke".to_string()),
        tags: Some(BTreeMap::from([("team".to_string(), "search".to_string())])),
        tests: Some(json!(tests)),
        ..Default::default()
    }
}

fn two_prompts() -> Vec<Prompt> {
    vec![
        Prompt {
            provider: Some("echo".to_string()),
            ..Prompt::new("Answer {{i}}", "first")
        },
        Prompt {
            provider: Some("echo".to_string()),
            ..Prompt::new("Reply {{i}}", "second")
        },
    ]
}

fn result(prompt_idx: usize, test_idx: usize, outcome: Outcome) -> EvaluateResult {
    let mut r = EvaluateResult::with_outcome(prompt_idx, test_idx, outcome);
    r.test_case = json!({"vars": {"i": test_idx}});
    r.response = Some(json!({"output": format!("out {}", test_idx)}));
    r
}

#[test]
fn test_create_then_find_matches() {
    let db = EvalDb::in_memory().unwrap();
    let eval = Eval::create(
        &db,
        config_with_tests(3),
        &two_prompts(),
        CreateOptions {
            author: Some("me@example.com".to_string()),
            results: vec![result(0, 0, Outcome::Pass)],
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(eval.results_count(), 1);

    let found = Eval::find_by_id(&db, &eval.id).unwrap().unwrap();
    assert_eq!(found.id, eval.id);
    assert_eq!(found.created_at, eval.created_at);
    assert_eq!(found.author.as_deref(), Some("me@example.com"));
    assert_eq!(found.description.as_deref(), Some("smoke"));
    assert_eq!(found.config, eval.config);
    assert_eq!(found.prompts, eval.prompts);
    assert_eq!(found.dataset_id, eval.dataset_id);
    assert_eq!(found.version(), NORMALIZED_VERSION);
    assert!(found.persisted);

    assert!(Eval::find_by_id(&db, "eval-zzz-2020-01-01T00:00:00").unwrap().is_none());
}

#[test]
fn test_evals_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("evals.db");
    let id = {
        let db = EvalDb::new(&path).unwrap();
        Eval::create(&db, config_with_tests(1), &two_prompts(), CreateOptions::default())
            .unwrap()
            .id
    };

    let db = EvalDb::new(&path).unwrap();
    let latest = Eval::latest(&db).unwrap().unwrap();
    assert_eq!(latest.id, id);
}

#[test]
fn test_delete_leaves_no_references() {
    let db = EvalDb::in_memory().unwrap();
    let mut eval = Eval::create(&db, config_with_tests(2), &two_prompts(), CreateOptions::default()).unwrap();
    let other = Eval::create(&db, config_with_tests(2), &two_prompts(), CreateOptions::default()).unwrap();
    for t in 0..2 {
        eval.add_result(&db, result(0, t, Outcome::Pass)).unwrap();
    }

    assert!(db.count_references(&eval.id).unwrap() > 0);
    assert!(eval.delete(&db).unwrap());
    assert_eq!(db.count_references(&eval.id).unwrap(), 0);
    assert!(Eval::find_by_id(&db, &eval.id).unwrap().is_none());

    // The other eval still reaches the shared dataset.
    let still = Eval::find_by_id(&db, &other.id).unwrap().unwrap();
    assert_eq!(still.dataset_id, other.dataset_id);
    assert!(!eval.delete(&db).unwrap());
}

#[test]
fn test_add_result_unpersisted_keeps_call_order() {
    let db = EvalDb::in_memory().unwrap();
    let mut eval = Eval::new(config_with_tests(3), Default::default());
    for t in [2, 0, 1] {
        eval.add_result(&db, result(0, t, Outcome::Pass)).unwrap();
    }
    assert_eq!(eval.results_count(), 3);
    let order: Vec<usize> = eval.results().iter().map(|r| r.result.test_idx).collect();
    assert_eq!(order, vec![2, 0, 1]);
}

#[test]
fn test_add_result_persisted_streams_to_storage() {
    let db = EvalDb::in_memory().unwrap();
    let mut eval = Eval::create(&db, config_with_tests(5), &two_prompts(), CreateOptions::default()).unwrap();
    for t in 0..5 {
        eval.add_result(&db, result(1, t, Outcome::Fail)).unwrap();
    }
    assert_eq!(eval.results_count(), 5);
    assert!(eval.results().is_empty());

    let mut reloaded = Eval::find_by_id(&db, &eval.id).unwrap().unwrap();
    reloaded.load_results(&db).unwrap();
    assert_eq!(reloaded.results().len(), 5);
    assert_eq!(reloaded.results_count(), 5);
}

#[test]
fn test_batch_count_is_ceiling() {
    let db = EvalDb::in_memory().unwrap();
    for (total, size) in [(0usize, 3usize), (1, 3), (9, 3), (10, 3), (10, 100), (250, 100)] {
        let mut eval = Eval::create(&db, UnifiedConfig::default(), &[], CreateOptions::default()).unwrap();
        let batch: Vec<_> = (0..total).map(|t| result(0, t, Outcome::Pass)).collect();
        eval.add_results(&db, batch).unwrap();

        let batches: Vec<_> = eval
            .fetch_results_batched(&db, Some(size))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(batches.len(), total.div_ceil(size), "R={} n={}", total, size);
        assert!(batches.iter().all(|b| b.len() <= size));

        let seen: Vec<usize> = batches.iter().flatten().map(|r| r.result.test_idx).collect();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());
    }
}

#[test]
fn test_summary_pass_rate_scenario() {
    let db = EvalDb::in_memory().unwrap();
    let mut eval = Eval::create(&db, config_with_tests(3), &two_prompts(), CreateOptions::default()).unwrap();
    let outcomes = [
        (0, [Outcome::Pass, Outcome::Pass, Outcome::Fail]),
        (1, [Outcome::Pass, Outcome::Pass, Outcome::Pass]),
    ];
    for (prompt_idx, per_test) in outcomes {
        for (test_idx, outcome) in per_test.into_iter().enumerate() {
            eval.add_result(&db, result(prompt_idx, test_idx, outcome)).unwrap();
        }
    }
    eval.rebuild_prompt_metrics(&db).unwrap();

    let summaries = get_eval_summaries(&db, None).unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.num_tests, 3);
    assert!((summary.pass_rate - 83.333).abs() < 0.01);
    assert_eq!(summary.label, format!("smoke ({})", eval.id));
    assert!(!summary.is_redteam);

    let stats = eval.get_stats();
    assert_eq!((stats.successes, stats.failures, stats.errors), (5, 1, 0));
}

#[test]
fn test_partial_run_fails_summary() {
    let db = EvalDb::in_memory().unwrap();
    let mut eval = Eval::create(&db, config_with_tests(3), &two_prompts(), CreateOptions::default()).unwrap();
    for t in 0..3 {
        eval.add_result(&db, result(0, t, Outcome::Pass)).unwrap();
    }
    eval.add_result(&db, result(1, 0, Outcome::Pass)).unwrap();
    eval.rebuild_prompt_metrics(&db).unwrap();

    let err = get_eval_summaries(&db, None).unwrap_err();
    assert!(matches!(err, StoreError::InconsistentData(_)));
}

#[test]
fn test_summaries_filter_by_dataset_and_flag_redteam() {
    let db = EvalDb::in_memory().unwrap();
    let plain = Eval::create(&db, config_with_tests(1), &[], CreateOptions::default()).unwrap();
    let mut redteam_config = config_with_tests(4);
    redteam_config.redteam = Some(json!({"plugins": ["harmful"]}));
    let redteam = Eval::create(&db, redteam_config, &[], CreateOptions::default()).unwrap();

    let all = get_eval_summaries(&db, None).unwrap();
    assert_eq!(all.len(), 2);

    let only = get_eval_summaries(&db, redteam.dataset_id.as_deref()).unwrap();
    assert_eq!(only.len(), 1);
    assert_eq!(only[0].eval_id, redteam.id);
    assert!(only[0].is_redteam);
    assert_eq!(only[0].pass_rate, 0.0);

    let other = get_eval_summaries(&db, plain.dataset_id.as_deref()).unwrap();
    assert!(!other[0].is_redteam);
}

#[test]
fn test_results_file_round_trip() {
    let db = EvalDb::in_memory().unwrap();
    let policy = RuntimePolicy::default();
    let mut eval = Eval::create(&db, config_with_tests(2), &two_prompts(), CreateOptions::default()).unwrap();
    for p in 0..2 {
        for t in 0..2 {
            eval.add_result(&db, result(p, t, if t == 0 { Outcome::Pass } else { Outcome::Error }))
                .unwrap();
        }
    }
    eval.rebuild_prompt_metrics(&db).unwrap();

    let file = eval.to_results_file(&db, &policy).unwrap();
    let text = serde_json::to_string(&file).unwrap();
    let parsed: ResultsFile = serde_json::from_str(&text).unwrap();
    let mut rebuilt = Eval::from_results_file(parsed).unwrap();

    assert_eq!(rebuilt.version(), eval.version());
    assert_eq!(rebuilt.config, eval.config);
    assert_eq!(rebuilt.get_prompts(), eval.get_prompts());
    assert_eq!(rebuilt.get_stats(), eval.get_stats());
    assert_eq!(rebuilt.results_count(), 4);
    match rebuilt.get_results(&db).unwrap() {
        EvalResults::Normalized(records) => assert_eq!(records.len(), 4),
        other => panic!("expected normalized results, got {:?}", other),
    }

    // Importing persists it under a fresh id with its results.
    let imported = Eval::import(&db, eval.to_results_file(&db, &policy).unwrap()).unwrap();
    assert_ne!(imported.id, eval.id);
    assert_eq!(db.count_results(&imported.id).unwrap(), 4);
}

#[test]
fn test_legacy_import_keeps_embedded_table() {
    let db = EvalDb::in_memory().unwrap();
    let file: ResultsFile = serde_json::from_value(json!({
        "version": 3,
        "createdAt": "2023-06-01T12:00:00.000Z",
        "config": {"description": "old run"},
        "author": null,
        "prompts": [],
        "datasetId": null,
        "results": {
            "version": 2,
            "timestamp": "2023-06-01T12:00:00.000Z",
            "results": [{"success": true}, {"success": false}],
            "table": {
                "head": {
                    "prompts": [{
                        "raw": "Hi", "label": "hi", "provider": "echo",
                        "metrics": {"testPassCount": 1, "testFailCount": 1}
                    }],
                    "vars": ["who"]
                },
                "body": []
            },
            "stats": {"successes": 1, "failures": 1}
        }
    }))
    .unwrap();

    let imported = Eval::import(&db, file).unwrap();
    let mut eval = Eval::find_by_id(&db, &imported.id).unwrap().unwrap();
    assert_eq!(eval.version(), LEGACY_VERSION);
    assert!(eval.uses_legacy_results());
    assert_eq!(eval.get_vars(&db).unwrap(), vec!["who".to_string()]);
    assert_eq!(eval.get_stats().successes, 1);
    assert_eq!(eval.results_count(), 2);

    match eval.to_evaluate_summary(&db, &RuntimePolicy::default()).unwrap() {
        EvaluateSummary::V2(summary) => assert_eq!(summary.version, 2),
        other => panic!("expected v2 summary, got {:?}", other),
    }

    let err = eval.add_result(&db, result(0, 0, Outcome::Pass)).unwrap_err();
    assert!(matches!(err, StoreError::Precondition(_)));

    let summaries = get_eval_summaries(&db, None).unwrap();
    assert_eq!(summaries[0].num_tests, 2);
    assert!((summaries[0].pass_rate - 50.0).abs() < 1e-9);
}

#[test]
fn test_table_view_of_normalized_eval() {
    let db = EvalDb::in_memory().unwrap();
    let mut eval = Eval::create(&db, config_with_tests(2), &two_prompts(), CreateOptions::default()).unwrap();
    for p in 0..2 {
        for t in 0..2 {
            eval.add_result(&db, result(p, t, Outcome::Pass)).unwrap();
        }
    }
    let table = eval.get_table(&db).unwrap();
    assert_eq!(table.head.prompts.len(), 2);
    assert_eq!(table.head.vars, vec!["i".to_string()]);
    assert_eq!(table.body.len(), 2);
    assert_eq!(table.body[1].outputs.len(), 2);
    assert_eq!(table.body[1].outputs[1].text, "out 1");
    assert_eq!(eval.get_vars(&db).unwrap(), vec!["i".to_string()]);
}
