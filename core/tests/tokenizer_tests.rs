use search_core::tokenizer::{tokenize, tokenize_page};
use std::fs;
use tempfile::tempdir;

#[test]
fn it_normalizes_and_stems() {
    let toks = tokenize("Running Runners RUN! The café's menu.");
    let words: Vec<String> = toks.into_iter().map(|(w, _)| w).collect();
    // Stemming to "run" should appear
    assert!(words.contains(&"run".to_string()));
    // Unicode normalization keeps accented letters inside the word
    assert!(words.iter().any(|w| w.starts_with("caf")));
}

#[test]
fn it_filters_stopwords() {
    let toks = tokenize("The quick brown fox and the lazy dog");
    let words: Vec<String> = toks.into_iter().map(|(w, _)| w).collect();
    assert!(!words.contains(&"the".to_string()));
    assert!(!words.contains(&"and".to_string()));
}

#[test]
fn it_reads_pages_relative_to_the_corpus_root() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("0")).unwrap();
    fs::write(dir.path().join("0/0"), "<title>foo</title><body>foo</body>").unwrap();
    let metas = tokenize_page(dir.path(), "0/0").unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].token, "foo");
    assert_eq!(metas[0].weight, 5);
    assert!(tokenize_page(dir.path(), "0/missing").is_err());
}
