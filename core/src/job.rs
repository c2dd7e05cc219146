use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// One unit of crawl/index work: a corpus-relative document path and the URL it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub path: String,
    pub url: String,
}

impl Job {
    pub fn new(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self { path: path.into(), url: url.into() }
    }

    /// Wire form used in the idle/active lists.
    pub fn encode(&self) -> String {
        // Serializing two plain strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(entry: &str) -> Result<Job> {
        serde_json::from_str(entry).map_err(|e| Error::MalformedJob { entry: entry.to_string(), reason: e.to_string() })
    }
}

/// Orders manifest entries deepest/newest first: paths compare by their
/// `/`-separated segments, numerically where both segments are numbers.
pub fn sort_jobs(manifest: &HashMap<String, String>) -> Vec<Job> {
    let mut jobs: Vec<Job> = manifest.iter().map(|(path, url)| Job::new(path.clone(), url.clone())).collect();
    jobs.sort_by(|a, b| compare_paths(&b.path, &a.path).then_with(|| b.path.cmp(&a.path)));
    jobs
}

fn compare_paths(a: &str, b: &str) -> Ordering {
    let mut left = a.split('/');
    let mut right = b.split('/');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_inverts_encode_with_awkward_strings() {
        for (path, url) in [
            ("0/0", "http://a"),
            ("a|b/c", "http://x.y/?q=\"1\",2"),
            ("line\nbreak", "tab\there\\slash"),
            ("", ""),
            ("{\"path\":1}", "ünïcödé"),
        ] {
            let job = Job::new(path, url);
            assert_eq!(Job::decode(&job.encode()).unwrap(), job);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Job::decode("0/0 http://a").unwrap_err();
        assert!(matches!(err, Error::MalformedJob { .. }));
    }

    #[test]
    fn sorts_numeric_segments_descending() {
        let mut manifest = HashMap::new();
        for p in ["0/2", "0/10", "1/0", "0/1", "10/3"] {
            manifest.insert(p.to_string(), format!("http://{p}"));
        }
        let order: Vec<String> = sort_jobs(&manifest).into_iter().map(|j| j.path).collect();
        assert_eq!(order, vec!["10/3", "1/0", "0/10", "0/2", "0/1"]);
    }

    #[test]
    fn numerically_equal_paths_sort_the_same_every_time() {
        for _ in 0..16 {
            let manifest: HashMap<String, String> =
                ["0/1", "0/01", "0/001", "00/1"].iter().map(|p| (p.to_string(), String::new())).collect();
            let order: Vec<String> = sort_jobs(&manifest).into_iter().map(|j| j.path).collect();
            assert_eq!(order, vec!["00/1", "0/1", "0/01", "0/001"]);
        }
    }
}
