use criterion::{criterion_group, criterion_main, Criterion};
use search_core::tokenizer::{tokenize, tokenize_html};

const PAGE: &str = r#"<html><head><title>Informatics Undergraduate Programs</title>
<style>body { font-family: sans-serif; }</style></head>
<body><h1>Computer Science</h1><h2>Software Engineering</h2>
<p>The undergraduate programs in informatics prepare students for careers in software,
human-computer interaction, and information systems. Students running experiments
in the lab learn data structures, algorithms, databases and distributed systems.</p>
<script>console.log("ignored");</script></body></html>"#;

fn bench_tokenize(c: &mut Criterion) {
    let text = PAGE.repeat(20);
    c.bench_function("tokenize_text", |b| b.iter(|| tokenize(&text)));
    c.bench_function("tokenize_html_page", |b| b.iter(|| tokenize_html(PAGE)));
}

criterion_group!(benches, bench_tokenize);
criterion_main!(benches);
