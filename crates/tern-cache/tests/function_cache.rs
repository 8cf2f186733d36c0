use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tern_cache::{CacheConfig, Fingerprint, FunctionResponseCache, ResourceId};
use tern_dap::{
    Array, ConstraintEvaluator, Dataset, Dim, Payload, ScalarKind, ScalarValue, Sequence,
    Variable,
};

/// Marks everything to send and returns the send-flagged subset, counting
/// invocations through a shared side channel.
struct StubEvaluator {
    calls: Arc<AtomicUsize>,
}

impl StubEvaluator {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Self { calls: calls.clone() }, calls)
    }
}

impl ConstraintEvaluator for StubEvaluator {
    fn parse_constraint(&mut self, _constraint: &str, dataset: &mut Dataset) -> tern_dap::Result<()> {
        dataset.mark_all_send();
        Ok(())
    }

    fn eval_functions(&mut self, dataset: &Dataset) -> tern_dap::Result<Dataset> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = Dataset::new(dataset.name());
        for variable in dataset.variables().iter().filter(|v| v.send()) {
            let mut copy = variable.clone();
            copy.set_read(true);
            result.add_var(copy);
        }
        Ok(result)
    }
}

/// Fails every evaluation.
struct FailingEvaluator;

impl ConstraintEvaluator for FailingEvaluator {
    fn parse_constraint(&mut self, _constraint: &str, dataset: &mut Dataset) -> tern_dap::Result<()> {
        dataset.mark_all_send();
        Ok(())
    }

    fn eval_functions(&mut self, _dataset: &Dataset) -> tern_dap::Result<Dataset> {
        Err(tern_dap::DapError::Eval("function exploded".into()))
    }
}

fn sample_dataset(name: &str) -> Dataset {
    let mut dataset = Dataset::new(name);
    dataset.add_var(Variable::scalar("x", ScalarValue::Float64(3.5)));
    dataset.add_var(Variable::new(
        "temp",
        Payload::Array(Array {
            element: ScalarKind::Int32,
            dims: vec![Dim::new("time", 3)],
            values: vec![
                ScalarValue::Int32(1),
                ScalarValue::Int32(2),
                ScalarValue::Int32(3),
            ],
        }),
    ));

    let mut obs = Sequence::new(vec![
        Variable::scalar("site", ScalarValue::Str(String::new())),
        Variable::scalar("value", ScalarValue::Float64(0.0)),
    ]);
    obs.push_row(vec![
        Payload::Scalar(ScalarValue::Str("a".into())),
        Payload::Scalar(ScalarValue::Float64(1.0)),
    ])
    .unwrap();
    obs.push_row(vec![
        Payload::Scalar(ScalarValue::Str("b".into())),
        Payload::Scalar(ScalarValue::Float64(2.0)),
    ])
    .unwrap();
    dataset.add_var(Variable::new("obs", Payload::Sequence(obs)));

    dataset
}

fn cache_with_limit(tmp: &TempDir, size_limit_mb: u64) -> FunctionResponseCache {
    FunctionResponseCache::new(CacheConfig {
        cache_dir: tmp.path().to_path_buf(),
        prefix: "rc".into(),
        size_limit_mb,
    })
}

fn entry_path(cache: &FunctionResponseCache, dataset: &str, constraint: &str, suffix: u64) -> PathBuf {
    let fingerprint = Fingerprint::of(&ResourceId::new(dataset, constraint));
    cache.store().entry_path(fingerprint, suffix)
}

fn witness_of(path: &PathBuf) -> String {
    let bytes = fs::read(path).unwrap();
    let end = bytes.iter().position(|&b| b == b'\n').expect("no witness line");
    String::from_utf8(bytes[..end].to_vec()).unwrap()
}

fn entry_files(cache: &FunctionResponseCache) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(cache.store().dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| cache.store().is_entry(p))
        .collect();
    files.sort();
    files
}

#[test]
fn cold_miss_then_hit_evaluates_once() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    let mut dataset = sample_dataset("ds.nc");
    let first = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let path = entry_path(&cache, "ds.nc", "mean(x)", 0);
    assert!(path.is_file());
    assert_eq!(witness_of(&path), "ds.nc#mean(x)");

    let mut dataset = sample_dataset("ds.nc");
    let second = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "hits never invoke the evaluator");
    assert_eq!(second, first);
}

#[test]
fn repeated_calls_converge_to_one_evaluation() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    let mut reference = None;
    for _ in 0..5 {
        let mut dataset = sample_dataset("ds.nc");
        let result = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
        let reference = reference.get_or_insert(result.clone());
        assert_eq!(result, *reference);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn oversized_resource_id_bypasses_the_cache() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    let name = "d".repeat(100);
    let constraint = "c".repeat(4000);
    let mut dataset = sample_dataset(&name);
    cache.get_or_compute(&mut dataset, &constraint, &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(entry_files(&cache).is_empty(), "bypass must not touch disk");

    let mut dataset = sample_dataset(&name);
    cache.get_or_compute(&mut dataset, &constraint, &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "nothing was cached");
}

#[test]
fn missing_directory_disables_the_cache() {
    let tmp = TempDir::new().unwrap();
    let cache = FunctionResponseCache::new(CacheConfig {
        cache_dir: tmp.path().join("absent"),
        prefix: "rc".into(),
        size_limit_mb: 1,
    });
    assert!(!cache.is_enabled());

    let (mut eval, calls) = StubEvaluator::new();
    let mut dataset = sample_dataset("ds.nc");
    let result = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.variables().len(), 3);
    assert!(!tmp.path().join("absent").exists());
}

#[test]
fn config_from_keys_builds_a_working_cache() {
    let tmp = TempDir::new().unwrap();
    let mut keys = BTreeMap::new();
    keys.insert(
        tern_cache::PATH_KEY.to_string(),
        tmp.path().to_string_lossy().into_owned(),
    );
    keys.insert(tern_cache::PREFIX_KEY.to_string(), "RC".to_string());
    keys.insert(tern_cache::SIZE_KEY.to_string(), "1".to_string());

    let cache = FunctionResponseCache::new(CacheConfig::from_keys(&keys));
    assert!(cache.is_enabled());
    assert_eq!(cache.store().prefix(), "rc");
}

#[test]
fn collision_scans_to_the_next_suffix() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    // Occupy suffix 0 with an entry whose witness belongs to someone else,
    // exactly what a fingerprint collision leaves on disk.
    let slot0 = entry_path(&cache, "ds.nc", "mean(x)", 0);
    fs::write(&slot0, b"other.nc#different(y)\nrest of that entry\n").unwrap();

    let mut dataset = sample_dataset("ds.nc");
    let first = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let slot1 = entry_path(&cache, "ds.nc", "mean(x)", 1);
    assert_eq!(witness_of(&slot0), "other.nc#different(y)", "foreign entry untouched");
    assert_eq!(witness_of(&slot1), "ds.nc#mean(x)");

    let mut dataset = sample_dataset("ds.nc");
    let second = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second lookup hits at suffix 1");
    assert_eq!(second, first);
}

#[test]
fn eviction_keeps_the_total_under_the_limit() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    // Each response carries a ~200 KB array; ten of them overflow 1 MB.
    let mut last_name = String::new();
    for i in 0..10 {
        let name = format!("ds{i}.nc");
        let mut dataset = Dataset::new(&name);
        dataset.add_var(Variable::new(
            "big",
            Payload::Array(Array {
                element: ScalarKind::Float64,
                dims: vec![Dim::new("n", 25_600)],
                values: (0..25_600).map(|v| ScalarValue::Float64(v as f64)).collect(),
            }),
        ));
        cache.get_or_compute(&mut dataset, "big", &mut eval).unwrap();
        last_name = name;
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    let limit = 1024 * 1024;
    assert!(
        cache.ledger().total().unwrap() <= limit,
        "total must settle at or under the limit"
    );

    // The most recently written entry was protected from self-eviction and
    // is still readable.
    let last = entry_path(&cache, &last_name, "big", 0);
    assert!(last.is_file());
    let mut dataset = Dataset::new(&last_name);
    dataset.add_var(Variable::new(
        "big",
        Payload::Array(Array::new(ScalarKind::Float64, vec![Dim::new("n", 25_600)])),
    ));
    cache.get_or_compute(&mut dataset, "big", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 10, "latest entry is a hit");
}

#[test]
fn zero_byte_entry_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    let slot0 = entry_path(&cache, "ds.nc", "mean(x)", 0);
    fs::write(&slot0, b"").unwrap();

    let mut dataset = sample_dataset("ds.nc");
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(fs::metadata(&slot0).unwrap().len() > 0);
    assert_eq!(witness_of(&slot0), "ds.nc#mean(x)");
    assert_eq!(entry_files(&cache).len(), 1, "rebuilt in place, not beside");

    let mut dataset = sample_dataset("ds.nc");
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn truncated_entry_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    // Correct witness, but the body stops before the data boundary.
    let slot0 = entry_path(&cache, "ds.nc", "mean(x)", 0);
    fs::write(&slot0, b"ds.nc#mean(x)\n<Dataset name=\"ds.nc\">\n").unwrap();

    let mut dataset = sample_dataset("ds.nc");
    let first = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut dataset = sample_dataset("ds.nc");
    let second = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second, first);
}

#[test]
fn entry_older_than_its_dataset_is_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, calls) = StubEvaluator::new();

    let source = tmp.path().join("ds.nc");
    fs::write(&source, b"original bytes").unwrap();
    let name = source.to_string_lossy().into_owned();

    let mut dataset = sample_dataset(&name);
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Touch the source after the entry was written.
    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(&source, b"newer bytes").unwrap();

    let mut dataset = sample_dataset(&name);
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "stale entry must be recomputed");

    let mut dataset = sample_dataset(&name);
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "rebuilt entry is fresh again");
}

#[test]
fn failed_evaluation_leaves_no_partial_entry() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);

    let mut dataset = sample_dataset("ds.nc");
    let err = cache
        .get_or_compute(&mut dataset, "mean(x)", &mut FailingEvaluator)
        .unwrap_err();
    assert!(err.to_string().contains("function exploded"));
    assert!(entry_files(&cache).is_empty());

    // The slot is free again for a successful build.
    let (mut eval, calls) = StubEvaluator::new();
    let mut dataset = sample_dataset("ds.nc");
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entry_files(&cache).len(), 1);
}

#[test]
fn global_instance_is_initialized_once() {
    let tmp = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_dir: tmp.path().to_path_buf(),
        prefix: "rc".into(),
        size_limit_mb: 1,
    };
    let first = FunctionResponseCache::initialize_global(config);
    let second = FunctionResponseCache::initialize_global(CacheConfig::default());
    assert!(std::ptr::eq(first, second), "the first configuration wins");
    assert!(FunctionResponseCache::global().is_some());
}

#[test]
fn rehydrated_sequences_are_ready_to_serialize_again() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_with_limit(&tmp, 1);
    let (mut eval, _calls) = StubEvaluator::new();

    let mut dataset = sample_dataset("ds.nc");
    cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();

    let mut dataset = sample_dataset("ds.nc");
    let hit = cache.get_or_compute(&mut dataset, "mean(x)", &mut eval).unwrap();
    let Payload::Sequence(seq) = hit.variables()[2].payload() else {
        panic!("expected sequence variable");
    };
    assert!(seq.is_replay(), "hits must not re-open the data source");
    assert_eq!(seq.row_cursor(), 0, "cursor reset after deserialization");
    assert_eq!(seq.unsent_rows().len(), 2);
    assert!(hit.variables().iter().all(|v| v.read() && v.send()));
}
