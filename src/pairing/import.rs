//! Import of precomputed feature matches.
//!
//! The input file is a sequence of pair blocks: a header line with two
//! image names, then one `idx1 idx2` line per match, terminated by a blank
//! line. Matches are written straight to the database; the worker pool
//! never runs.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::control::{StopToken, Timer};
use crate::database::{FeatureMatch, FeatureMatches, ImageId, SharedDatabase};
use crate::matching::MatcherCache;

/// Images whose descriptors an import run may touch; the importer itself
/// only resolves names, so a small cache suffices.
const CACHE_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct FeaturePairsOptions {
    /// Path to the match file.
    pub match_list_path: PathBuf,
}

pub struct FeaturePairsImporter {
    options: FeaturePairsOptions,
    cache: Arc<MatcherCache>,
    stop: StopToken,
}

impl FeaturePairsImporter {
    pub fn new(options: FeaturePairsOptions, database: SharedDatabase) -> Self {
        let cache = Arc::new(MatcherCache::new(CACHE_SIZE, database));
        Self {
            options,
            cache,
            stop: StopToken::new(),
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Importing matches");
        let total = Timer::start();

        self.cache.setup()?;

        let image_ids = self.cache.get_image_ids();
        let name_to_id: HashMap<&str, ImageId> = image_ids
            .iter()
            .map(|&image_id| (self.cache.get_image(image_id).name.as_str(), image_id))
            .collect();

        let path = &self.options.match_list_path;
        let file = File::open(path)
            .with_context(|| format!("failed to open match file {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();

        while let Some(line) = lines.next() {
            if self.stop.is_stopped() {
                total.log_total("Importing matches");
                return Ok(());
            }

            let line = line?;
            let header = line.trim();
            if header.is_empty() {
                continue;
            }

            // Once a header cannot be resolved the remaining lines could be
            // headers or match rows, so parsing stops rather than guessing.
            let mut parts = header.split_whitespace();
            let (Some(name1), Some(name2)) = (parts.next(), parts.next()) else {
                error!("Malformed pair header '{header}', stopping import");
                break;
            };

            info!("{name1} - {name2}");

            let Some(&image_id1) = name_to_id.get(name1) else {
                warn!("Image {name1} not found in database, stopping import");
                break;
            };
            let Some(&image_id2) = name_to_id.get(name2) else {
                warn!("Image {name2} not found in database, stopping import");
                break;
            };

            let exists = self.cache.exists_matches(image_id1, image_id2)?;
            if exists {
                info!("Skipping pair, matches already exist");
            }

            let mut matches = FeatureMatches::new();
            let mut parse_failed = false;
            for line in lines.by_ref() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    break;
                }

                let mut parts = line.split_whitespace();
                let idx1 = parts.next().and_then(|s| s.parse::<u32>().ok());
                let idx2 = parts.next().and_then(|s| s.parse::<u32>().ok());
                match (idx1, idx2) {
                    (Some(idx1), Some(idx2)) => matches.push(FeatureMatch { idx1, idx2 }),
                    _ => {
                        error!("Cannot read feature match from line '{line}', stopping import");
                        parse_failed = true;
                        break;
                    }
                }
            }
            if parse_failed {
                break;
            }

            if exists {
                continue;
            }
            if image_id1 == image_id2 {
                warn!("Skipping self pair {name1} - {name2}");
                continue;
            }

            self.cache.write_matches(image_id1, image_id2, &matches)?;
        }

        total.log_total("Importing matches");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::database::{Database, FeatureMatch};
    use crate::pairing::testing::{matched_pairs, populated_database};

    fn write_match_file(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matches.txt");
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    fn importer(path: PathBuf, database: &SharedDatabase) -> FeaturePairsImporter {
        FeaturePairsImporter::new(
            FeaturePairsOptions {
                match_list_path: path,
            },
            Arc::clone(database),
        )
    }

    #[test]
    fn test_import_writes_blocks() {
        let database = populated_database(&["a.jpg", "b.jpg", "c.jpg"]);
        let (_dir, path) = write_match_file(
            "a.jpg b.jpg\n\
             0 1\n\
             1 0\n\
             \n\
             b.jpg c.jpg\n\
             5 6\n",
        );

        importer(path, &database).run().unwrap();

        assert_eq!(matched_pairs(&database), vec![(1, 2), (2, 3)]);
        assert_eq!(
            database.lock().read_matches(1, 2).unwrap(),
            vec![
                FeatureMatch { idx1: 0, idx2: 1 },
                FeatureMatch { idx1: 1, idx2: 0 }
            ]
        );
        // The final block is terminated by the end of the file.
        assert_eq!(
            database.lock().read_matches(2, 3).unwrap(),
            vec![FeatureMatch { idx1: 5, idx2: 6 }]
        );
    }

    #[test]
    fn test_existing_pair_parsed_but_skipped() {
        let database = populated_database(&["a.jpg", "b.jpg", "c.jpg"]);
        let prior = vec![FeatureMatch { idx1: 9, idx2: 9 }];
        database.lock().write_matches(1, 2, &prior).unwrap();

        let (_dir, path) = write_match_file(
            "a.jpg b.jpg\n\
             0 1\n\
             \n\
             a.jpg c.jpg\n\
             2 3\n",
        );

        importer(path, &database).run().unwrap();

        // The existing block is consumed without overwriting, and parsing
        // stays aligned for the following block.
        assert_eq!(database.lock().read_matches(1, 2).unwrap(), prior);
        assert_eq!(
            database.lock().read_matches(1, 3).unwrap(),
            vec![FeatureMatch { idx1: 2, idx2: 3 }]
        );
    }

    #[test]
    fn test_unknown_image_stops_import() {
        let database = populated_database(&["a.jpg", "b.jpg"]);
        let (_dir, path) = write_match_file(
            "a.jpg missing.jpg\n\
             0 1\n\
             \n\
             a.jpg b.jpg\n\
             2 3\n",
        );

        importer(path, &database).run().unwrap();

        // Everything after the unresolvable header is ignored.
        assert!(matched_pairs(&database).is_empty());
    }

    #[test]
    fn test_malformed_match_line_stops_import() {
        let database = populated_database(&["a.jpg", "b.jpg", "c.jpg"]);
        let (_dir, path) = write_match_file(
            "a.jpg b.jpg\n\
             0 not-a-number\n\
             \n\
             b.jpg c.jpg\n\
             1 2\n",
        );

        importer(path, &database).run().unwrap();

        assert!(matched_pairs(&database).is_empty());
    }

    #[test]
    fn test_empty_block_is_written_empty() {
        let database = populated_database(&["a.jpg", "b.jpg"]);
        let (_dir, path) = write_match_file("a.jpg b.jpg\n\n");

        importer(path, &database).run().unwrap();

        assert!(database.lock().exists_matches(1, 2).unwrap());
        assert!(database.lock().read_matches(1, 2).unwrap().is_empty());
    }
}
