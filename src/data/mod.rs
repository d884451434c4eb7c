//! Data sources for evaluation and calibration
//!
//! A [`DataSource`] is an opaque iterator of input batches, built from a
//! `data_configs` entry by the factory registered for its `type`.
//!
//! Built-in types:
//! - `JsonLinesDataContainer`: batches of JSON lines from
//!   `params_config.data_file`
//! - `DummyDataContainer`: `max_samples` empty objects (default 1)
//! - `HuggingfaceContainer`, `RawDataContainer`, `DataContainer`: handed
//!   through to external tools only

use crate::config::DataConfig;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

/// One batch of inputs.
pub type Batch = Vec<serde_json::Value>;

/// Iterator over batches.
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Supplies input batches.
pub trait DataSource: Send + Sync + std::fmt::Debug {
    /// Data config name.
    fn name(&self) -> &str;

    /// Declaration this source was built from.
    fn config(&self) -> &DataConfig;

    /// Start a fresh pass over the data.
    ///
    /// # Errors
    /// Returns `DataLoader` error if the data cannot be opened.
    fn batches(&self) -> Result<BatchIter<'_>>;
}

fn param_usize(config: &DataConfig, key: &str) -> Result<Option<usize>> {
    match config.params_config.get(key) {
        None => Ok(None),
        Some(value) if value.is_null() => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| {
                Error::config(format!(
                    "data config '{}': params_config.{key} must be a non-negative integer",
                    config.name
                ))
            }),
    }
}

/// Batches of JSON values read line by line.
#[derive(Debug, Clone)]
pub struct JsonLinesDataSource {
    config: DataConfig,
    path: PathBuf,
    batch_size: usize,
    max_samples: Option<usize>,
}

impl JsonLinesDataSource {
    /// Build from config.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if `data_file` is missing or
    /// `batch_size` is zero.
    pub fn new(config: DataConfig) -> Result<Self> {
        let path = config
            .params_config
            .get("data_file")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::config(format!(
                    "data config '{}' needs params_config.data_file",
                    config.name
                ))
            })?;
        let batch_size = param_usize(&config, "batch_size")?.unwrap_or(1);
        if batch_size == 0 {
            return Err(Error::config(format!(
                "data config '{}': batch_size must be at least 1",
                config.name
            )));
        }
        let max_samples = param_usize(&config, "max_samples")?;
        Ok(Self {
            config,
            path,
            batch_size,
            max_samples,
        })
    }
}

impl DataSource for JsonLinesDataSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &DataConfig {
        &self.config
    }

    fn batches(&self) -> Result<BatchIter<'_>> {
        let file = std::fs::File::open(&self.path).map_err(|e| {
            Error::DataLoader(format!("cannot open {}: {e}", self.path.display()))
        })?;
        let path = self.path.clone();
        let lines = std::io::BufReader::new(file)
            .lines()
            .enumerate()
            .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
            .take(self.max_samples.unwrap_or(usize::MAX))
            .map(move |(number, line)| {
                let line = line.map_err(|e| Error::DataLoader(format!("{}: {e}", path.display())))?;
                serde_json::from_str::<serde_json::Value>(&line).map_err(|e| {
                    Error::DataLoader(format!("{}:{}: {e}", path.display(), number + 1))
                })
            });
        Ok(Box::new(Chunks {
            inner: lines,
            size: self.batch_size,
        }))
    }
}

struct Chunks<I> {
    inner: I,
    size: usize,
}

impl<I> Iterator for Chunks<I>
where
    I: Iterator<Item = Result<serde_json::Value>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.size);
        for item in self.inner.by_ref() {
            match item {
                Ok(value) => batch.push(value),
                Err(e) => return Some(Err(e)),
            }
            if batch.len() == self.size {
                break;
            }
        }
        (!batch.is_empty()).then_some(Ok(batch))
    }
}

/// Fixed number of empty-object samples.
#[derive(Debug, Clone)]
pub struct DummyDataSource {
    config: DataConfig,
    samples: usize,
    batch_size: usize,
}

impl DummyDataSource {
    /// Build from config.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for malformed sizes.
    pub fn new(config: DataConfig) -> Result<Self> {
        let samples = param_usize(&config, "max_samples")?.unwrap_or(1);
        let batch_size = param_usize(&config, "batch_size")?.unwrap_or(1).max(1);
        Ok(Self {
            config,
            samples,
            batch_size,
        })
    }
}

impl DataSource for DummyDataSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &DataConfig {
        &self.config
    }

    fn batches(&self) -> Result<BatchIter<'_>> {
        let empty = || serde_json::Value::Object(serde_json::Map::new());
        let samples = (0..self.samples).map(move |_| Ok(empty()));
        Ok(Box::new(Chunks {
            inner: samples,
            size: self.batch_size,
        }))
    }
}

/// Source whose data only an external tool can load.
#[derive(Debug, Clone)]
pub struct ExternalDataSource {
    config: DataConfig,
}

impl ExternalDataSource {
    /// Wrap a config.
    #[must_use]
    pub const fn new(config: DataConfig) -> Self {
        Self { config }
    }
}

impl DataSource for ExternalDataSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &DataConfig {
        &self.config
    }

    fn batches(&self) -> Result<BatchIter<'_>> {
        Err(Error::DataLoader(format!(
            "data config '{}' of type {} is loaded by external tools only",
            self.config.name, self.config.data_type
        )))
    }
}

/// Factory building a source from its config.
pub type DataSourceFactory = Arc<dyn Fn(DataConfig) -> Result<Arc<dyn DataSource>> + Send + Sync>;

/// Data source factories by config `type`.
#[derive(Clone)]
pub struct DataRegistry {
    factories: BTreeMap<String, DataSourceFactory>,
}

impl DataRegistry {
    /// Empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in types.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("JsonLinesDataContainer", |config| {
            Ok(Arc::new(JsonLinesDataSource::new(config)?) as Arc<dyn DataSource>)
        });
        registry.register("DummyDataContainer", |config| {
            Ok(Arc::new(DummyDataSource::new(config)?) as Arc<dyn DataSource>)
        });
        for external in ["HuggingfaceContainer", "RawDataContainer", "DataContainer"] {
            registry.register(external, |config| {
                Ok(Arc::new(ExternalDataSource::new(config)) as Arc<dyn DataSource>)
            });
        }
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, data_type: impl Into<String>, factory: F)
    where
        F: Fn(DataConfig) -> Result<Arc<dyn DataSource>> + Send + Sync + 'static,
    {
        self.factories.insert(data_type.into(), Arc::new(factory));
    }

    /// Build a source.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for unregistered types or factory
    /// rejections.
    pub fn build(&self, config: DataConfig) -> Result<Arc<dyn DataSource>> {
        let factory = self.factories.get(&config.data_type).ok_or_else(|| {
            Error::config(format!(
                "data config '{}' has unknown type '{}'",
                config.name, config.data_type
            ))
        })?;
        factory(config)
    }
}

impl Default for DataRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for DataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Sources built from the run's `data_configs`, by name.
#[derive(Debug, Clone, Default)]
pub struct DataCatalog {
    sources: BTreeMap<String, Arc<dyn DataSource>>,
}

impl DataCatalog {
    /// Build every declared source.
    ///
    /// # Errors
    /// See [`DataRegistry::build`].
    pub fn build(registry: &DataRegistry, configs: &BTreeMap<String, DataConfig>) -> Result<Self> {
        let mut sources = BTreeMap::new();
        for (name, config) in configs {
            sources.insert(name.clone(), registry.build(config.clone())?);
        }
        Ok(Self { sources })
    }

    /// Look up a source by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.get(name).cloned()
    }

    /// Add a source (used for inline configs).
    pub fn insert(&mut self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    /// Number of sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::OptionValue;
    use std::io::Write;

    fn config(data_type: &str, params: &[(&str, OptionValue)]) -> DataConfig {
        DataConfig {
            name: "calib".to_string(),
            data_type: data_type.to_string(),
            params_config: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            components: BTreeMap::new(),
            load_dataset_config: None,
            pre_process_data_config: None,
            post_process_data_config: None,
            dataloader_config: None,
        }
    }

    #[test]
    fn test_json_lines_batches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(file, "{{\"x\": {i}}}").unwrap();
        }
        writeln!(file).unwrap();
        let source = JsonLinesDataSource::new(config(
            "JsonLinesDataContainer",
            &[
                ("data_file", file.path().to_string_lossy().as_ref().into()),
                ("batch_size", OptionValue::Int(2)),
            ],
        ))
        .unwrap();
        let sizes: Vec<usize> = source.batches().unwrap().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, [2, 2, 1]);
    }

    #[test]
    fn test_json_lines_max_samples_and_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"x\": 1}}").unwrap();
        writeln!(file, "not json").unwrap();
        let path: OptionValue = file.path().to_string_lossy().as_ref().into();

        let limited = JsonLinesDataSource::new(config(
            "JsonLinesDataContainer",
            &[("data_file", path.clone()), ("max_samples", OptionValue::Int(1))],
        ))
        .unwrap();
        assert_eq!(limited.batches().unwrap().count(), 1);

        let full = JsonLinesDataSource::new(config("JsonLinesDataContainer", &[("data_file", path)]))
            .unwrap();
        let results: Vec<_> = full.batches().unwrap().collect();
        assert!(results.iter().any(Result::is_err));
    }

    #[test]
    fn test_missing_data_file() {
        assert!(JsonLinesDataSource::new(config("JsonLinesDataContainer", &[])).is_err());
        let source = JsonLinesDataSource::new(config(
            "JsonLinesDataContainer",
            &[("data_file", "/nonexistent/calib.jsonl".into())],
        ))
        .unwrap();
        assert!(matches!(source.batches().err().unwrap(), Error::DataLoader(_)));
    }

    #[test]
    fn test_registry() {
        let registry = DataRegistry::with_builtins();
        let dummy = registry.build(config("DummyDataContainer", &[])).unwrap();
        assert_eq!(dummy.batches().unwrap().count(), 1);
        assert!(registry.build(config("Nope", &[])).is_err());
        let hf = registry.build(config("HuggingfaceContainer", &[])).unwrap();
        assert!(hf.batches().is_err());
    }
}
