use approx::assert_abs_diff_eq;
use cardiocascade::config::{AngioOrEcg, CascadeConfig, SplitMethod, ThresholdMethod};
use cardiocascade::data::{CsvSetTagSource, LoadOptions, load_patient_table};
use cardiocascade::progress::{BootProgressObserver, NoopBootProgress};
use cardiocascade::{
    BootStage, BootstrapSettings, BootstrapTrainer, CascadeError, CascadeEvaluator,
    RidgeLogisticSettings, RidgeLogisticTrainer,
};
use polars::prelude::{Column, CsvWriter, DataFrame, SerWriter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

const N_ROWS: usize = 120;
const N_BOOTS: usize = 3;
const DIAGNOSES: [&str; 3] = ["Normal", "Chronic", "T1MI"];

fn write_frame(path: &Path, columns: Vec<Column>) {
    let mut df = DataFrame::new(columns).unwrap();
    let mut file = File::create(path).unwrap();
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(&mut df)
        .unwrap();
}

/// Writes the base table (boot 0) and one tag file per further boot.
///
/// `marker` separates the three diagnoses cleanly; `noise` and `ecg_qt` carry
/// no signal.
fn write_cohort(dir: &Path) {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut tags_by_boot = Vec::with_capacity(N_BOOTS);
    for boot in 0..N_BOOTS {
        let mut order: Vec<usize> = (0..N_ROWS).collect();
        order.shuffle(&mut StdRng::seed_from_u64(100 + boot as u64));
        let mut tags = vec![""; N_ROWS];
        for (rank, &row) in order.iter().enumerate() {
            tags[row] = match rank * 10 / N_ROWS {
                0..=5 => "train",
                6 | 7 => "val",
                _ => "test",
            };
        }
        tags_by_boot.push(tags);
    }

    let ids: Vec<i64> = (0..N_ROWS as i64).map(|row| 1000 + row).collect();
    let diagnosis: Vec<&str> = (0..N_ROWS).map(|row| DIAGNOSES[row % 3]).collect();
    let marker: Vec<f64> = (0..N_ROWS)
        .map(|row| 3.0 * (row % 3) as f64 + rng.gen_range(-0.5..0.5))
        .collect();
    let mut uniform = |lo: f64, hi: f64| -> Vec<f64> {
        (0..N_ROWS).map(|_| rng.gen_range(lo..hi)).collect()
    };
    let trop0 = uniform(1.0, 50.0);
    let noise = uniform(-1.0, 1.0);
    let ecg_qt = uniform(380.0, 460.0);

    write_frame(
        &dir.join("data_raw_trop6_phys_0.csv"),
        vec![
            Column::new("idPatient".into(), ids.clone()),
            Column::new("adjudicatorDiagnosis".into(), diagnosis),
            Column::new("trop0".into(), trop0),
            Column::new("marker".into(), marker),
            Column::new("noise".into(), noise),
            Column::new("ecg_qt".into(), ecg_qt),
            Column::new("set0".into(), tags_by_boot[0].clone()),
        ],
    );
    for (boot, tags) in tags_by_boot.iter().enumerate().skip(1) {
        write_frame(
            &dir.join(format!("data_raw_trop6_phys_{boot}.csv")),
            vec![
                Column::new("idPatient".into(), ids.clone()),
                Column::new(format!("set{boot}").into(), tags.clone()),
            ],
        );
    }
}

fn config() -> CascadeConfig {
    let mut config = CascadeConfig::default();
    config
        .features
        .ecg
        .insert("data3".to_string(), vec!["ecg_qt".to_string()]);
    config
}

fn load_options() -> LoadOptions {
    LoadOptions {
        dataset: "data3".to_string(),
        label_name: "adjudicatorDiagnosis".to_string(),
        angio_or_ecg: AngioOrEcg::Angio,
    }
}

fn trainer() -> RidgeLogisticTrainer {
    RidgeLogisticTrainer::new(RidgeLogisticSettings {
        n_folds: 5,
        ..RidgeLogisticSettings::default()
    })
}

#[derive(Default)]
struct RecordingProgress {
    finished: Mutex<Vec<usize>>,
    total: Mutex<Option<usize>>,
}

impl BootProgressObserver for RecordingProgress {
    fn on_run_start(&self, total_boots: usize) {
        *self.total.lock().unwrap() = Some(total_boots);
    }

    fn on_boot_finish(&self, boot: usize) {
        self.finished.lock().unwrap().push(boot);
    }
}

#[test]
fn cross_validated_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path());
    let config = config();
    let tags = CsvSetTagSource::new(dir.path());
    let base = load_patient_table(&tags.path_for(0), &config, &load_options()).unwrap();
    assert_eq!(base.feature_names, vec!["marker", "noise"]);

    let trainer = trainer();
    let settings = BootstrapSettings {
        n_boots: N_BOOTS,
        threshold_method: ThresholdMethod::Tprn,
        split_method: SplitMethod::Cv,
        ..BootstrapSettings::default()
    };
    let bootstrap = BootstrapTrainer::new(&base, &config.labels, &trainer, &tags, settings);
    let progress = RecordingProgress::default();
    let artifacts = bootstrap.run(&progress).unwrap();

    assert_eq!(*progress.total.lock().unwrap(), Some(N_BOOTS));
    assert_eq!(*progress.finished.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(
        artifacts.iter().map(|a| a.boot).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    for artifact in &artifacts {
        assert_eq!(artifact.in_bag_rows, 96);
        assert_eq!(artifact.out_of_bag.n_rows(), 24);
    }

    let out_dir = dir.path().join("results");
    let report = CascadeEvaluator::new(&config.labels)
        .with_output_dir(&out_dir)
        .evaluate(&artifacts)
        .unwrap();
    assert_eq!(report.n_boots, N_BOOTS);
    assert!(report.level1_accuracy.mean > 0.9, "{:?}", report.level1_accuracy);
    assert!(report.three_way_accuracy.mean > 0.8, "{:?}", report.three_way_accuracy);
    for row in &report.mean_confusion {
        assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    for boot in 0..N_BOOTS {
        let written = out_dir
            .join("outbags_adjudicatorDiagnosis")
            .join(format!("out_bag{boot}.csv"));
        assert_eq!(fs::read_to_string(&written).unwrap().lines().count(), 25);
    }
}

#[test]
fn parallel_and_sequential_runs_agree() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path());
    let config = config();
    let tags = CsvSetTagSource::new(dir.path());
    let base = load_patient_table(&tags.path_for(0), &config, &load_options()).unwrap();
    let trainer = trainer();

    let run = |parallel: bool| {
        let settings = BootstrapSettings {
            n_boots: N_BOOTS,
            threshold_method: ThresholdMethod::Youden,
            split_method: SplitMethod::Fixed,
            parallel,
            ..BootstrapSettings::default()
        };
        BootstrapTrainer::new(&base, &config.labels, &trainer, &tags, settings)
            .run(&NoopBootProgress)
            .unwrap()
    };
    let sequential = run(false);
    let parallel = run(true);

    for (a, b) in sequential.iter().zip(&parallel) {
        assert_eq!(a.boot, b.boot);
        assert_abs_diff_eq!(
            a.model.level1.rule.threshold,
            b.model.level1.rule.threshold,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            a.model.level2.rule.threshold,
            b.model.level2.rule.threshold,
            epsilon = 1e-12
        );
        assert_eq!(a.out_of_bag.row_ids, b.out_of_bag.row_ids);
    }
}

#[test]
fn missing_tag_file_names_the_failing_boot() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path());
    let config = config();
    let tags = CsvSetTagSource::new(dir.path());
    let base = load_patient_table(&tags.path_for(0), &config, &load_options()).unwrap();
    let trainer = trainer();

    let settings = BootstrapSettings {
        n_boots: N_BOOTS + 1,
        ..BootstrapSettings::default()
    };
    let err = BootstrapTrainer::new(&base, &config.labels, &trainer, &tags, settings)
        .run(&NoopBootProgress)
        .unwrap_err();
    match err {
        CascadeError::Boot { boot, stage, .. } => {
            assert_eq!(boot, N_BOOTS);
            assert_eq!(stage, BootStage::SetTags);
        }
        other => panic!("expected a boot failure, got {other}"),
    }
}

#[test]
fn normal_and_chronic_test_population_filter() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path());
    let config = config();
    let tags = CsvSetTagSource::new(dir.path());
    let base = load_patient_table(&tags.path_for(0), &config, &load_options()).unwrap();
    let trainer = trainer();

    let settings = BootstrapSettings {
        n_boots: 1,
        test_on_normal_and_chronic_only: true,
        ..BootstrapSettings::default()
    };
    let artifacts = BootstrapTrainer::new(&base, &config.labels, &trainer, &tags, settings)
        .run(&NoopBootProgress)
        .unwrap();
    let diagnosis = artifacts[0].out_of_bag.diagnosis.as_ref().unwrap();
    assert!(!diagnosis.is_empty());
    assert!(diagnosis.iter().all(|d| d == "Normal" || d == "Chronic"));
    assert_eq!(artifacts[0].in_bag_rows, 96);

    let report = CascadeEvaluator::new(&config.labels)
        .evaluate(&artifacts)
        .unwrap();
    assert_eq!(report.n_boots, 1);
}

#[test]
fn missing_label_column_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path());
    let options = LoadOptions {
        label_name: "event_dmi30d".to_string(),
        ..load_options()
    };
    let path = dir.path().join("data_raw_trop6_phys_0.csv");
    let err = load_patient_table(&path, &config(), &options).unwrap_err();
    assert!(matches!(err, CascadeError::Configuration(_)), "{err}");
}
