use crate::data::{ExtraInfo, RatingStore, TIMESTAMPS_KEY};
use crate::error::EvalError;
use crate::param::Param;
use log::{debug, info, warn};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Populates a rating store from some source.
pub trait DataLoader {
    fn load_data(&self, store: &mut RatingStore, rng: &mut ChaCha8Rng) -> Result<(), EvalError>;
}

/// Reads `user<sep>item<sep>rating[<sep>timestamp]` lines and post-processes the store.
#[derive(Debug, Clone)]
pub struct DefaultDataLoader {
    pub path: String,
    pub separator: String,
    pub with_timestamps: bool,
    pub min_rating: i8,
    pub max_rating: i8,
    pub max_lines: usize,
    pub min_ratings_per_user: usize,
    pub sample_n_users: usize,
    pub density: f64,
    pub binarize_level: i8,
    pub unary_ratings: bool,
}

impl DefaultDataLoader {
    pub fn new(param: &Param) -> DefaultDataLoader {
        let data = &param.data;
        DefaultDataLoader {
            path: data.path.clone(),
            separator: data.separator.clone(),
            with_timestamps: data.with_timestamps,
            min_rating: data.min_rating,
            max_rating: data.max_rating,
            max_lines: data.max_lines,
            min_ratings_per_user: data.min_ratings_per_user,
            sample_n_users: data.sample_n_users,
            density: data.density,
            binarize_level: data.binarize_level,
            unary_ratings: data.unary_ratings,
        }
    }

    /// Parses rating lines into `store`. Returns the number of ratings read.
    pub fn read_ratings<R: BufRead>(&self, reader: R, store: &mut RatingStore) -> Result<usize, EvalError> {
        let mut timestamps: HashMap<(u32, u32), i64> = HashMap::new();
        let mut count = 0;

        for (line_number, line) in reader.lines().enumerate() {
            if self.max_lines > 0 && count >= self.max_lines {
                debug!("Stopping after {} lines (max_lines)", self.max_lines);
                break;
            }
            let line = line?;
            let trimmed_line = line.trim();
            if trimmed_line.is_empty() || trimmed_line.starts_with("//") {
                continue;
            }

            let fields: Vec<&str> = trimmed_line.split(self.separator.as_str()).map(|f| f.trim()).collect();
            let expected = if self.with_timestamps { 4 } else { 3 };
            if fields.len() < expected {
                return Err(EvalError::Data(format!(
                    "line {}: expected {} fields separated by '{}', found {}",
                    line_number + 1, expected, self.separator, fields.len()
                )));
            }

            let user = parse_field::<u32>(fields[0], "user", line_number)?;
            let item = parse_field::<u32>(fields[1], "item", line_number)?;
            let value = parse_field::<f32>(fields[2], "rating", line_number)?;
            if !value.is_finite() || value.round() < i8::MIN as f32 || value.round() > i8::MAX as f32 {
                return Err(EvalError::Data(format!("line {}: rating {} cannot be stored", line_number + 1, fields[2])));
            }
            if value < self.min_rating as f32 || value > self.max_rating as f32 {
                warn!("line {}: rating {} lies outside [{}, {}]", line_number + 1, value, self.min_rating, self.max_rating);
            }
            store.add_rating(user, item, value.round() as i8);

            if self.with_timestamps {
                let ts = parse_field::<i64>(fields[3], "timestamp", line_number)?;
                timestamps.insert((user, item), ts);
            }
            count += 1;
        }

        if self.with_timestamps {
            store.add_extra_information(TIMESTAMPS_KEY, ExtraInfo::Timestamps(timestamps));
        }
        Ok(count)
    }

    /// Applies user sampling, the per-user minimum, density reduction and binarization, in that order.
    pub fn post_process(&self, store: &mut RatingStore, rng: &mut ChaCha8Rng) {
        if self.sample_n_users > 0 {
            store.sample_users(self.sample_n_users, rng);
        }
        if self.min_ratings_per_user > 0 {
            let removed = store.remove_sparse_users(self.min_ratings_per_user);
            debug!("Removed {} users with fewer than {} ratings", removed, self.min_ratings_per_user);
        }
        if self.density < 1.0 {
            store.reduce_density(self.density, rng);
        }
        if self.binarize_level > 0 {
            store.binarize(self.binarize_level, self.unary_ratings);
            let floor = if self.unary_ratings { 1 } else { 0 };
            store.set_rating_bounds(floor, 1);
        }
        store.recalculate_averages();
    }
}

fn parse_field<T: std::str::FromStr>(text: &str, what: &str, line_number: usize) -> Result<T, EvalError> {
    text.parse::<T>()
        .map_err(|_| EvalError::Data(format!("line {}: invalid {} '{}'", line_number + 1, what, text)))
}

impl DataLoader for DefaultDataLoader {
    fn load_data(&self, store: &mut RatingStore, rng: &mut ChaCha8Rng) -> Result<(), EvalError> {
        info!("Loading ratings from {}...", self.path);
        let file = File::open(&self.path)
            .map_err(|e| EvalError::Data(format!("cannot open {}: {}", self.path, e)))?;
        store.set_rating_bounds(self.min_rating, self.max_rating);

        let count = self.read_ratings(BufReader::new(file), store)?;
        if count == 0 {
            return Err(EvalError::Data(format!("{} contains no ratings", self.path)));
        }
        self.post_process(store, rng);

        info!(
            "Loaded {} ratings: {} users, {} items (density {:.5})",
            store.len(), store.user_count(), store.item_count(), store.density()
        );
        Ok(())
    }
}
