use crate::error::EvalError;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum EvaluationType {
    /// Rotate through the folds, each one serving once as test set
    crossvalidation,
    /// The splitter yields exactly one training and one test set
    giventrainingtestsplit,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum SplitMethod {
    random,
    time_based,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub split: Split,
    #[serde(default)]
    pub relevance: Relevance,
    #[serde(default)]
    pub algorithms: Vec<PluginSpec>,
    #[serde(default)]
    pub metrics: Vec<PluginSpec>,
    #[serde(skip)]
    pub tag: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default = "seed_default")]
    pub seed: u64,
    #[serde(default = "thread_number_default")]
    pub thread_number: usize,
    #[serde(default = "log_base_default")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "true_default")]
    pub display_colorful: bool,
    #[serde(default = "evaluation_type_default")]
    pub evaluation_type: EvaluationType,
    #[serde(default = "uzero_default")]
    pub max_validation_rounds: usize,
    #[serde(default = "empty_string")]
    pub given_n: String,
    #[serde(default = "uzero_default")]
    pub max_rating_predictions: usize,
    #[serde(default = "uzero_default")]
    pub max_recommendations: usize,
    #[serde(default = "empty_string")]
    pub save_exp: String,
    #[serde(default = "empty_string")]
    pub csv_path: String,
    #[serde(default = "false_default")]
    pub csv_append: bool,
    #[serde(default = "empty_string")]
    pub experiment_title: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "empty_string")]
    pub path: String,
    #[serde(default = "separator_default")]
    pub separator: String,
    #[serde(default = "false_default")]
    pub with_timestamps: bool,
    #[serde(default = "min_rating_default")]
    pub min_rating: i8,
    #[serde(default = "max_rating_default")]
    pub max_rating: i8,
    #[serde(default = "uzero_default")]
    pub max_lines: usize,
    #[serde(default = "uzero_default")]
    pub min_ratings_per_user: usize,
    #[serde(default = "uzero_default")]
    pub sample_n_users: usize,
    #[serde(default = "one_default")]
    pub density: f64,
    #[serde(default = "izero_default")]
    pub binarize_level: i8,
    #[serde(default = "true_default")]
    pub unary_ratings: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Split {
    #[serde(default = "split_method_default")]
    pub method: SplitMethod,
    #[serde(default = "folds_default")]
    pub nb_folds: usize,
    #[serde(default = "false_default")]
    pub global_random_split: bool,
    #[serde(default = "empty_string")]
    pub min_ratings_constraint: String,
    #[serde(default = "test_percentage_default")]
    pub test_percentage: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Relevance {
    #[serde(default = "top_n_default")]
    pub top_n: usize,
    #[serde(default = "min_rating_for_relevance_default")]
    pub min_rating_for_relevance: f32,
    #[serde(default = "zero_default")]
    pub min_percentage_above_average: f64,
}

/// Declaration of an algorithm or metric: a registry identifier plus its parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub params: PluginParams,
    /// Relative cost hint for the work queue, overriding the recommender's own estimate
    #[serde(default)]
    pub duration_estimate: Option<u8>,
}

/// Free-form plug-in parameters.
///
/// Human-readable formats see a plain mapping. Binary formats cannot describe a
/// self-typed YAML value, so the mapping travels as YAML text there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginParams(pub Mapping);

impl Serialize for PluginParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let text = serde_yaml::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
    }
}

impl<'de> Deserialize<'de> for PluginParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Ok(PluginParams(Mapping::deserialize(deserializer)?))
        } else {
            let text = String::deserialize(deserializer)?;
            serde_yaml::from_str(&text).map(PluginParams).map_err(serde::de::Error::custom)
        }
    }
}

impl PluginSpec {
    pub fn new(name: &str) -> PluginSpec {
        PluginSpec { name: name.to_string(), params: PluginParams::default(), duration_estimate: None }
    }

    /// Adds a parameter, builder style.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> PluginSpec {
        self.params.0.insert(Value::String(key.to_string()), value.into());
        self
    }

    /// Name used to identify this plug-in in results, e.g. `Precision(targetset=allintestset)`.
    pub fn label(&self) -> String {
        if self.params.0.is_empty() {
            return self.name.clone();
        }
        let rendered: Vec<String> = self.params.0.iter()
            .map(|(k, v)| format!("{}={}", scalar_text(k), scalar_text(v)))
            .collect();
        format!("{}({})", self.name, rendered.join(","))
    }

    /// Parses the parameters into the plug-in's typed configuration.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, EvalError> {
        serde_yaml::from_value(Value::Mapping(self.params.0.clone()))
            .map_err(|e| EvalError::Config(format!("invalid parameters for {}: {}", self.name, e)))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().replace('\n', " "),
    }
}

/// Parsed `"N/percentage"` given-N setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GivenN {
    /// Training ratings kept per selected user
    pub n: usize,
    /// Share of training users that get truncated
    pub percentage: f64,
}

/// Parsed `"perUser/perItem"` condensing thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinRatingsConstraint {
    pub per_user: usize,
    pub per_item: usize,
}

fn split_pair(text: &str, what: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = text.split('/').map(|p| p.trim()).collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(format!("Invalid {} '{}'. Expected two values separated by '/'.", what, text));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn given_n(&self) -> Result<Option<GivenN>, String> {
        if self.general.given_n.trim().is_empty() {
            return Ok(None);
        }
        let (n, pct) = split_pair(&self.general.given_n, "given_n")?;
        let n: usize = n.parse().map_err(|_| format!("Invalid given_n count '{}'.", n))?;
        let percentage: f64 = pct.parse().map_err(|_| format!("Invalid given_n percentage '{}'.", pct))?;
        if n == 0 || !(percentage > 0.0 && percentage <= 100.0) {
            return Err(format!(
                "Invalid given_n '{}'. The count must be > 0 and the percentage in (0, 100].",
                self.general.given_n
            ));
        }
        Ok(Some(GivenN { n, percentage }))
    }

    pub fn min_ratings_constraint(&self) -> Result<Option<MinRatingsConstraint>, String> {
        if self.split.min_ratings_constraint.trim().is_empty() {
            return Ok(None);
        }
        let (u, i) = split_pair(&self.split.min_ratings_constraint, "min_ratings_constraint")?;
        let per_user = u.parse().map_err(|_| format!("Invalid per-user minimum '{}'.", u))?;
        let per_item = i.parse().map_err(|_| format!("Invalid per-item minimum '{}'.", i))?;
        Ok(Some(MinRatingsConstraint { per_user, per_item }))
    }
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Split {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Relevance {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

pub fn get(param_file: String) -> Result<Param, Box<dyn Error>> {
    let param_file_reader = File::open(param_file)?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<(), String> {
    if param.general.log_base.len() > 0 {
        param.general.display_colorful = false;
    }

    if param.general.thread_number == 0 {
        return Err("thread_number must be at least 1.".to_string());
    }

    if param.algorithms.is_empty() {
        return Err("No algorithm declared. Add at least one entry under 'algorithms'.".to_string());
    }

    if param.metrics.is_empty() {
        return Err("No metric declared. Add at least one entry under 'metrics'.".to_string());
    }

    check_duplicates(&param.algorithms, "algorithm")?;
    check_duplicates(&param.metrics, "metric")?;

    validate_data(param)?;
    validate_split(param)?;

    param.given_n()?;

    if param.relevance.top_n == 0 {
        return Err("relevance.top_n must be at least 1.".to_string());
    }

    if param.general.max_validation_rounds > 0 {
        warn!(
            "max_validation_rounds={} caps the number of cross-validation rounds. Results are not comparable with full runs.",
            param.general.max_validation_rounds
        );
    }

    Ok(())
}

fn check_duplicates(specs: &[PluginSpec], kind: &str) -> Result<(), String> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.label()) {
            return Err(format!("Duplicate {} declaration: {}", kind, spec.label()));
        }
    }
    Ok(())
}

fn validate_data(param: &Param) -> Result<(), String> {
    if param.data.min_rating >= param.data.max_rating {
        return Err(format!(
            "Invalid rating scale [{}, {}]. min_rating must be lower than max_rating.",
            param.data.min_rating, param.data.max_rating
        ));
    }

    if param.data.density <= 0.0 || param.data.density > 1.0 {
        return Err(format!(
            "Invalid density={:.3}. Must be in range (0, 1].",
            param.data.density
        ));
    }

    if param.data.separator.is_empty() {
        return Err("data.separator cannot be empty.".to_string());
    }

    Ok(())
}

fn validate_split(param: &Param) -> Result<(), String> {
    match param.split.method {
        SplitMethod::random => {
            if param.split.nb_folds < 2 {
                return Err(format!("Invalid nb_folds={}. At least 2 folds are required.", param.split.nb_folds));
            }
            param.min_ratings_constraint()?;
        }
        SplitMethod::time_based => {
            if param.split.test_percentage <= 0.0 || param.split.test_percentage >= 100.0 {
                return Err(format!(
                    "Invalid test_percentage={:.3}. Must be in range (0, 100).",
                    param.split.test_percentage
                ));
            }
            if !param.data.with_timestamps {
                warn!("Time-based split selected but data.with_timestamps is false: the loader will not record timestamps.");
            }
            if !param.split.min_ratings_constraint.is_empty() {
                warn!("min_ratings_constraint is ignored by the time-based split.");
            }
        }
    }
    Ok(())
}

// Default value definitions

fn seed_default() -> u64 {
    4815162342
}
fn empty_string() -> String {
    "".to_string()
}
fn thread_number_default() -> usize {
    4
}
fn log_base_default() -> String {
    "".to_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn evaluation_type_default() -> EvaluationType {
    EvaluationType::crossvalidation
}
fn separator_default() -> String {
    "::".to_string()
}
fn min_rating_default() -> i8 {
    1
}
fn max_rating_default() -> i8 {
    5
}
fn split_method_default() -> SplitMethod {
    SplitMethod::random
}
fn folds_default() -> usize {
    5
}
fn test_percentage_default() -> f64 {
    20.0
}
fn top_n_default() -> usize {
    10
}
fn min_rating_for_relevance_default() -> f32 {
    -1.0
}
fn false_default() -> bool {
    false
}
fn true_default() -> bool {
    true
}
fn zero_default() -> f64 {
    0.0
}
fn one_default() -> f64 {
    1.0
}
fn izero_default() -> i8 {
    0
}
fn uzero_default() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Param {
        /// A valid configuration with one constant recommender and MAE.
        pub fn test() -> Param {
            let mut param = Param::default();
            param.algorithms.push(PluginSpec::new("ConstantRating").with("value", 3));
            param.metrics.push(PluginSpec::new("MAE"));
            param
        }
    }

    #[test]
    fn test_defaults() {
        let param = Param::default();
        assert_eq!(param.general.thread_number, 4);
        assert_eq!(param.general.evaluation_type, EvaluationType::crossvalidation);
        assert_eq!(param.split.nb_folds, 5);
        assert_eq!(param.data.separator, "::");
        assert_eq!(param.relevance.top_n, 10);
        assert_eq!(param.data.binarize_level, 0);
        assert!(param.data.unary_ratings);
        assert!(param.algorithms.is_empty());
    }

    #[test]
    fn test_yaml_sections_and_plugins() {
        let yaml = r#"
general:
  thread_number: 2
  given_n: "5/50"
split:
  nb_folds: 4
  min_ratings_constraint: "3/2"
algorithms:
  - name: PopularityAndAverage
    params: { userAverage: true }
    duration_estimate: 2
metrics:
  - name: MAE
  - name: Precision
    params:
      targetset: allintestset
"#;
        let mut param: Param = serde_yaml::from_str(yaml).unwrap();
        validate(&mut param).unwrap();
        assert_eq!(param.general.thread_number, 2);
        assert_eq!(param.split.nb_folds, 4);
        assert_eq!(param.given_n().unwrap(), Some(GivenN { n: 5, percentage: 50.0 }));
        assert_eq!(param.min_ratings_constraint().unwrap(), Some(MinRatingsConstraint { per_user: 3, per_item: 2 }));
        assert_eq!(param.algorithms[0].label(), "PopularityAndAverage(userAverage=true)");
        assert_eq!(param.algorithms[0].duration_estimate, Some(2));
        assert_eq!(param.metrics[0].label(), "MAE");
        assert_eq!(param.metrics[1].label(), "Precision(targetset=allintestset)");
    }

    #[test]
    fn test_missing_plugins_rejected() {
        let mut param = Param::default();
        assert!(validate(&mut param).unwrap_err().contains("algorithm"));
        param.algorithms.push(PluginSpec::new("ConstantRating"));
        assert!(validate(&mut param).unwrap_err().contains("metric"));
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let mut param = Param::test();
        param.metrics.push(PluginSpec::new("MAE"));
        let err = validate(&mut param).unwrap_err();
        assert!(err.contains("Duplicate metric"));

        // Same name with different parameters is a distinct declaration
        let mut param = Param::test();
        param.algorithms.push(PluginSpec::new("ConstantRating").with("value", 4));
        assert!(validate(&mut param).is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut param = Param::test();
        param.general.thread_number = 0;
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.split.nb_folds = 1;
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.data.min_rating = 5;
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.general.given_n = "five/50".to_string();
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.general.given_n = "5/0".to_string();
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.split.min_ratings_constraint = "3".to_string();
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.split.method = SplitMethod::time_based;
        param.split.test_percentage = 100.0;
        assert!(validate(&mut param).is_err());

        let mut param = Param::test();
        param.data.density = 0.0;
        assert!(validate(&mut param).is_err());
    }

    #[test]
    fn test_log_file_disables_colors() {
        let mut param = Param::test();
        param.general.log_base = "run".to_string();
        validate(&mut param).unwrap();
        assert!(!param.general.display_colorful);
    }

    #[test]
    fn test_plugin_config_parsing() {
        #[derive(Deserialize, Debug)]
        #[serde(deny_unknown_fields)]
        struct Config {
            #[serde(default)]
            value: f32,
        }
        let spec = PluginSpec::new("ConstantRating").with("value", 2.5);
        let config: Config = spec.config().unwrap();
        assert_eq!(config.value, 2.5);

        let unknown = PluginSpec::new("ConstantRating").with("valeu", 2.5);
        let err = unknown.config::<Config>().unwrap_err();
        assert!(err.is_configuration());

        let empty: Config = PluginSpec::new("ConstantRating").config().unwrap();
        assert_eq!(empty.value, 0.0);
    }

    #[test]
    fn test_plugin_params_survive_binary_encoding() {
        let spec = PluginSpec::new("Precision").with("targetset", "allintestset").with("k", 3);
        let encoded = bincode::serialize(&spec).unwrap();
        let decoded: PluginSpec = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, spec);
        assert_eq!(decoded.label(), "Precision(targetset=allintestset,k=3)");
    }

    #[test]
    fn test_get_reads_file() {
        let path = std::env::temp_dir().join("recoxval_param_get_test.yaml");
        std::fs::write(&path, "algorithms:\n  - name: ConstantRating\nmetrics:\n  - name: RMSE\n").unwrap();
        let param = get(path.to_string_lossy().to_string()).unwrap();
        assert_eq!(param.metrics[0].name, "RMSE");
        std::fs::remove_file(&path).unwrap();
        assert!(get(path.to_string_lossy().to_string()).is_err());
    }
}
