use crate::aggregate::{Dispersion, EvaluationResult};
use crate::data::RatingStore;
use crate::param::Param;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;

/// Shape of the rating data an experiment ran on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DatasetSummary {
    pub users: usize,
    pub items: usize,
    pub ratings: usize,
    pub min_rating: i8,
    pub max_rating: i8,
    pub density: f64,
}

impl DatasetSummary {
    pub fn new(store: &RatingStore) -> DatasetSummary {
        DatasetSummary {
            users: store.user_count(),
            items: store.item_count(),
            ratings: store.len(),
            min_rating: store.min_rating(),
            max_rating: store.max_rating(),
            density: store.density(),
        }
    }
}

/// Complete record of one evaluation run.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Experiment {
    /// Experiment ID, i.e., output name and timestamp
    pub id: String,
    /// Timestamp of the experiment
    pub timestamp: String,
    /// Crate version and git hash used
    pub recoxval_version: String,
    /// Parameters used
    pub parameters: Param,

    pub dataset: DatasetSummary,
    /// Description of the splitting strategy
    pub splitter: String,
    /// SHA-256 of the held-out sets, identical for identical partitions
    pub fold_fingerprint: String,
    pub rounds: usize,

    /// Raw results keyed by round (1-based)
    pub round_results: BTreeMap<usize, Vec<EvaluationResult>>,
    /// Per (algorithm, metric) averages over the rounds
    pub results: Vec<EvaluationResult>,
    pub dispersion: Vec<Dispersion>,

    /// Execution time in seconds
    pub execution_time: f64,
}

impl Experiment {
    /// Algorithms in result order.
    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for r in &self.results {
            if !names.contains(&r.algorithm) {
                names.push(r.algorithm.clone());
            }
        }
        names
    }

    /// Metrics in declaration order, as rendered labels.
    pub fn metrics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parameters.metrics.iter().map(|m| m.label()).collect();
        for r in &self.results {
            if !names.contains(&r.metric) {
                names.push(r.metric.clone());
            }
        }
        names.retain(|name| self.results.iter().any(|r| &r.metric == name));
        names
    }

    pub fn value(&self, algorithm: &str, metric: &str) -> Option<f64> {
        self.results.iter()
            .find(|r| r.algorithm == algorithm && r.metric == metric)
            .map(|r| r.value)
    }

    fn std_dev(&self, algorithm: &str, metric: &str) -> Option<f64> {
        self.dispersion.iter()
            .find(|d| d.algorithm == algorithm && d.metric == metric)
            .map(|d| d.std_dev)
    }

    pub fn display_results(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("\n=============== Experiment {} ===============\n\n", self.id));
        text.push_str(&format!("Recoxval version: v{}\n", self.recoxval_version));
        text.push_str(&format!("Timestamp: {}\n", self.timestamp));
        text.push_str(&format!(
            "Data: {} users, {} items, {} ratings (density {:.5}, scale [{}, {}])\n",
            self.dataset.users, self.dataset.items, self.dataset.ratings,
            self.dataset.density, self.dataset.min_rating, self.dataset.max_rating
        ));
        text.push_str(&format!("Split: {} | {} rounds | folds {}\n", self.splitter, self.rounds, &self.fold_fingerprint[..self.fold_fingerprint.len().min(12)]));
        text.push_str(&format!("Execution time: {:.2}s\n", self.execution_time));
        if !self.parameters.general.experiment_title.is_empty() {
            text.push_str(&format!("Title: {}\n", self.parameters.general.experiment_title));
        }
        text.push_str("Experiment results:\n\n");

        let metrics = self.metrics();
        let algorithms = self.algorithms();
        let width = algorithms.iter().map(|a| a.len()).max().unwrap_or(9).max(9);

        text.push_str(&format!("\x1b[1m{:<width$}", "Algorithm", width = width));
        for metric in &metrics {
            text.push_str(&format!(" | {:>18}", metric));
        }
        text.push_str("\x1b[0m\n");

        for algorithm in &algorithms {
            text.push_str(&format!("\x1b[1;96m{:<width$}\x1b[0m", algorithm, width = width));
            for metric in &metrics {
                let cell = match (self.value(algorithm, metric), self.std_dev(algorithm, metric)) {
                    (Some(v), Some(sd)) if !sd.is_nan() => format!("{:.4} ± {:.4}", v, sd),
                    (Some(v), _) => format!("{:.4}", v),
                    (None, _) => "-".to_string(),
                };
                text.push_str(&format!(" | {:>18}", cell));
            }
            text.push('\n');
        }
        text
    }

    /// Writes the averaged results as a `;`-separated table: an optional title line,
    /// a header `Algorithm;metric...` and one row per algorithm with three decimals.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P, append: bool) -> Result<(), Box<dyn Error>> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_writer(file);

        let title = &self.parameters.general.experiment_title;
        if !title.is_empty() {
            writer.write_record([title.as_str()])?;
        }

        let metrics = self.metrics();
        let mut header = vec!["Algorithm".to_string()];
        header.extend(metrics.iter().cloned());
        writer.write_record(&header)?;

        for algorithm in self.algorithms() {
            let mut row = vec![algorithm.clone()];
            for metric in &metrics {
                row.push(match self.value(&algorithm, metric) {
                    Some(v) if !v.is_nan() => format!("{:.3}", v),
                    _ => String::new(),
                });
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;
        info!("Results written to {}", path.display());
        Ok(())
    }

    /// Saves the experiment in a suitable format based on file extension.
    pub fn save_auto<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => self.save_json(path),
            "bin" | "bincode" => self.save_bincode(path),
            _ => {
                warn!("Unknown format. Saving experiment in JSON.");
                self.save_json(path.with_extension("json"))
            }
        }
    }

    /// Saves to JSON (human readable)
    fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Saves as Bincode (compact binary, Rust-only)
    fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let encoded = bincode::serialize(self)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    /// Loads the experiment from a file, automatically detecting the format based on file extension.
    pub fn load_auto<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => Self::load_json(path),
            "bin" | "bincode" => Self::load_bincode(path),
            _ => Self::load_with_fallback(path),
        }
    }

    fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let content = std::fs::read_to_string(path)?;
        let experiment: Experiment = serde_json::from_str(&content)?;
        Ok(experiment)
    }

    fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let bytes = std::fs::read(path)?;
        let experiment: Experiment = bincode::deserialize(&bytes)?;
        Ok(experiment)
    }

    /// Tries Bincode, then JSON.
    fn load_with_fallback<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();

        if let Ok(experiment) = Self::load_bincode(path) {
            return Ok(experiment);
        }

        if let Ok(experiment) = Self::load_json(path) {
            return Ok(experiment);
        }

        Err("Unable to load the experiment".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate, dispersion};
    use crate::param::PluginSpec;

    impl Experiment {
        pub fn test() -> Experiment {
            let mut parameters = Param::test();
            parameters.algorithms.push(PluginSpec::new("PopularityAndAverage"));
            parameters.metrics.push(PluginSpec::new("Precision").with("topN", 5));
            let mut round_results = BTreeMap::new();
            round_results.insert(1, vec![
                EvaluationResult::new("ConstantRating(value=3)", "MAE", 1.0, 1),
                EvaluationResult::new("ConstantRating(value=3)", "Precision(topN=5)", f64::NAN, 1),
                EvaluationResult::new("PopularityAndAverage", "MAE", 0.5, 1),
                EvaluationResult::new("PopularityAndAverage", "Precision(topN=5)", 0.25, 1),
            ]);
            round_results.insert(2, vec![
                EvaluationResult::new("ConstantRating(value=3)", "MAE", 2.0, 2),
                EvaluationResult::new("ConstantRating(value=3)", "Precision(topN=5)", f64::NAN, 2),
                EvaluationResult::new("PopularityAndAverage", "MAE", 0.7, 2),
                EvaluationResult::new("PopularityAndAverage", "Precision(topN=5)", 0.75, 2),
            ]);
            Experiment {
                id: "test_2026-01-01_00-00-00".to_string(),
                timestamp: "2026-01-01_00-00-00".to_string(),
                recoxval_version: "0.0.0#test".to_string(),
                parameters,
                dataset: DatasetSummary::new(&RatingStore::test_grid(3, 4)),
                splitter: "per-user random split (2 folds)".to_string(),
                fold_fingerprint: "ab".repeat(32),
                rounds: 2,
                results: aggregate(&round_results).unwrap(),
                dispersion: dispersion(&round_results),
                round_results,
                execution_time: 0.5,
            }
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("recoxval_experiment_{}", name))
    }

    #[test]
    fn test_algorithms_and_metrics_order() {
        let exp = Experiment::test();
        assert_eq!(exp.algorithms(), vec!["ConstantRating(value=3)", "PopularityAndAverage"]);
        assert_eq!(exp.metrics(), vec!["MAE", "Precision(topN=5)"]);
        assert_eq!(exp.value("ConstantRating(value=3)", "MAE"), Some(1.5));
        assert_eq!(exp.value("Unknown", "MAE"), None);
    }

    #[test]
    fn test_display_results_lists_every_cell() {
        let text = Experiment::test().display_results();
        assert!(text.contains("Experiment test_2026-01-01_00-00-00"));
        assert!(text.contains("PopularityAndAverage"));
        assert!(text.contains("0.6000 ± 0.1414"));
        assert!(text.contains("NaN"));
    }

    #[test]
    fn test_export_csv_with_title_and_append() {
        let path = temp_path("export.csv");
        let mut exp = Experiment::test();
        exp.parameters.general.experiment_title = "Baselines".to_string();
        exp.export_csv(&path, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![
            "Baselines",
            "Algorithm;MAE;Precision(topN=5)",
            "ConstantRating(value=3);1.500;",
            "PopularityAndAverage;0.600;0.500",
        ]);

        exp.export_csv(&path, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 8);
        exp.export_csv(&path, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 4);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_save_and_load_keep_results() {
        let exp = Experiment::test();
        for name in ["save.json", "save.bin"] {
            let path = temp_path(name);
            exp.save_auto(&path).unwrap();
            let loaded = Experiment::load_auto(&path).unwrap();
            assert_eq!(loaded.id, exp.id);
            assert_eq!(loaded.parameters, exp.parameters);
            assert_eq!(loaded.value("PopularityAndAverage", "Precision(topN=5)"), Some(0.5));
            assert!(loaded.value("ConstantRating(value=3)", "Precision(topN=5)").unwrap().is_nan());
            std::fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn test_unknown_extension_falls_back_to_json() {
        let path = temp_path("save.out");
        Experiment::test().save_auto(&path).unwrap();
        let json_path = path.with_extension("json");
        assert!(json_path.exists());
        assert!(Experiment::load_auto(&json_path).is_ok());
        std::fs::remove_file(&json_path).unwrap();
        assert!(Experiment::load_auto(temp_path("missing.out")).is_err());
    }
}
