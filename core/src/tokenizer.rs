use crate::index::{BODY_WEIGHT, HEADER_WEIGHT, TITLE_WEIGHT};
use lazy_static::lazy_static;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use scraper::{ElementRef, Html, Node, Selector};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref RE: Regex = Regex::new(r"(?u)[\p{L}\p{N}][\p{L}\p{N}_']*").expect("valid regex");
    static ref STEMMER: Stemmer = Stemmer::create(Algorithm::English);
    static ref TITLE: Selector = Selector::parse("title").expect("valid selector");
    static ref HEADERS: Selector = Selector::parse("h1, h2, h3, h4, h5, h6").expect("valid selector");
    static ref BODY: Selector = Selector::parse("body").expect("valid selector");
    static ref STOPWORDS: HashSet<&'static str> = {
        let words: &[&str] = &[
            "a","about","above","after","again","against","all","am","an","and","any","are","aren't","as","at",
            "be","because","been","before","being","below","between","both","but","by",
            "can","can't","cannot","could","couldn't",
            "did","didn't","do","does","doesn't","doing","don't","down","during",
            "each","few","for","from","further",
            "had","hadn't","has","hasn't","have","haven't","having","he","he'd","he'll","he's","her","here","here's","hers","herself","him","himself","his","how","how's",
            "i","i'd","i'll","i'm","i've","if","in","into","is","isn't","it","it's","its","itself",
            "let's","me","more","most","mustn't","my","myself",
            "no","nor","not","of","off","on","once","only","or","other","ought","our","ours","ourselves","out","over","own",
            "same","she","she'd","she'll","she's","should","shouldn't","so","some","such",
            "than","that","that's","the","their","theirs","them","themselves","then","there","there's","these","they","they'd","they'll","they're","they've","this","those","through","to","too",
            "under","until","up","very",
            "was","wasn't","we","we'd","we'll","we're","we've","were","weren't","what","what's","when","when's","where","where's","which","while","who","who's","whom","why","why's","with","won't","would","wouldn't",
            "you","you'd","you'll","you're","you've","your","yours","yourself","yourselves"
        ];
        words.iter().copied().collect()
    };
}

fn is_stopword(token: &str) -> bool { STOPWORDS.contains(token) }

/// Tokenize text into (term, position) using NFKC normalization, lowercase, stopword removal, and stemming.
pub fn tokenize(text: &str) -> Vec<(String, usize)> {
    let normalized = text.nfkc().collect::<String>().to_lowercase();
    let mut tokens = Vec::new();
    for (pos, mat) in RE.find_iter(&normalized).enumerate() {
        let token = mat.as_str();
        if is_stopword(token) { continue; }
        let stem = STEMMER.stem(token).to_string();
        tokens.push((stem, pos));
    }
    tokens
}

/// One distinct token of a page with its weighted count and body positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMeta {
    pub token: String,
    pub weight: i64,
    pub positions: Vec<usize>,
}

/// Reads `root/path` and tokenizes it as a page.
pub fn tokenize_page(root: &Path, path: &str) -> io::Result<Vec<TokenMeta>> {
    let bytes = std::fs::read(root.join(path))?;
    Ok(tokenize_html(&String::from_utf8_lossy(&bytes)))
}

/// Weighs every token of an HTML (or plain text) document: title words x4,
/// header words x2, and each occurrence in the body text x1. Script and style
/// content is ignored.
pub fn tokenize_html(source: &str) -> Vec<TokenMeta> {
    let doc = Html::parse_document(source);
    let mut metas: BTreeMap<String, TokenMeta> = BTreeMap::new();
    let mut bump = |token: String, weight: i64, position: Option<usize>| {
        let meta = metas.entry(token.clone()).or_insert_with(|| TokenMeta { token, weight: 0, positions: Vec::new() });
        meta.weight += weight;
        if let Some(p) = position {
            meta.positions.push(p);
        }
    };

    for title in doc.select(&TITLE) {
        for (token, _) in tokenize(&title.text().collect::<Vec<_>>().join(" ")) {
            bump(token, TITLE_WEIGHT, None);
        }
    }
    for header in doc.select(&HEADERS) {
        for (token, _) in tokenize(&header.text().collect::<Vec<_>>().join(" ")) {
            bump(token, HEADER_WEIGHT, None);
        }
    }
    if let Some(body) = doc.select(&BODY).next() {
        for (token, pos) in tokenize(&visible_text(body)) {
            bump(token, BODY_WEIGHT, Some(pos));
        }
    }
    metas.into_values().collect()
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        if let Node::Text(text) = node.value() {
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| matches!(e.name(), "script" | "style" | "noscript" | "template")))
                .unwrap_or(false);
            if !hidden {
                parts.push(&**text);
            }
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tokenize() {
        let t = tokenize("Running, runner's run!");
        assert!(t.iter().any(|(w, _)| w == "run"));
    }

    #[test]
    fn title_and_header_occurrences_are_weighted() {
        let html = "<html><head><title>Foo</title></head><body><h1>Bar</h1><p>foo bar baz</p></body></html>";
        let metas = tokenize_html(html);
        let weight = |t: &str| metas.iter().find(|m| m.token == t).map(|m| m.weight);
        assert_eq!(weight("foo"), Some(TITLE_WEIGHT + BODY_WEIGHT));
        // header text is also body text
        assert_eq!(weight("bar"), Some(HEADER_WEIGHT + 2 * BODY_WEIGHT));
        assert_eq!(weight("baz"), Some(BODY_WEIGHT));
    }

    #[test]
    fn scripts_and_styles_are_skipped() {
        let html = "<body><script>var secret = 1;</script><style>.hidden{}</style><p>hello</p></body>";
        let tokens: Vec<String> = tokenize_html(html).into_iter().map(|m| m.token).collect();
        assert_eq!(tokens, vec!["hello".to_string()]);
    }

    #[test]
    fn plain_text_is_body_text() {
        let metas = tokenize_html("quick brown fox quick");
        let quick = metas.iter().find(|m| m.token == "quick").unwrap();
        assert_eq!(quick.weight, 2);
        assert_eq!(quick.positions, vec![0, 3]);
    }
}
