use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use soapbind::descriptor::MatchSpec;
use soapbind::extension::compression::compress;
use soapbind::formatter::pattern::PatternMatcher;
use soapbind::param::HttpEncoding;
use soapbind::util::{parse_query, url_decode, url_encode, ByteEncoding};
use soapbind::value::{ReturnType, TypeTag};

fn url_escape_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_escape");
    let inputs = [
        ("ascii", "hello world, this is plain text"),
        ("latin", "café crème brûlée à la carte"),
        ("cjk", "协议绑定与扩展管线"),
    ];

    for (name, text) in inputs.iter() {
        group.bench_with_input(BenchmarkId::new("utf8", name), text, |b, text| {
            b.iter(|| url_encode(black_box(text), Some(ByteEncoding::Utf8)));
        });
        group.bench_with_input(BenchmarkId::new("unicode", name), text, |b, text| {
            b.iter(|| url_encode(black_box(text), None));
        });
        let encoded = url_encode(text, None);
        group.bench_with_input(BenchmarkId::new("decode", name), &encoded, |b, encoded| {
            b.iter(|| url_decode(black_box(encoded), ByteEncoding::Utf8));
        });
    }

    group.finish();
}

fn query_parse_benchmark(c: &mut Criterion) {
    let query = "a=1&b=2&values=3&values=4&values=5&text=hello+world&name=%E5%8D%8F%E8%AE%AE";
    c.bench_function("query_parse", |b| {
        b.iter(|| parse_query(black_box(query), ByteEncoding::Utf8));
    });
}

fn pattern_match_benchmark(c: &mut Criterion) {
    let page = "<html><head><title>Quarterly Report</title></head><body>\
                <a href=\"/one\">1</a><a href=\"/two\">2</a><a href=\"/three\">3</a>\
                </body></html>";
    let title = PatternMatcher::new(&MatchSpec::new("<title>(.*?)</title>").group(1), ReturnType::scalar(TypeTag::String))
        .unwrap();
    let links = PatternMatcher::new(&MatchSpec::new("href=\"([^\"]*)\"").group(1), ReturnType::array(TypeTag::String))
        .unwrap();

    let mut group = c.benchmark_group("pattern_match");
    group.bench_function("scalar", |b| b.iter(|| title.matches(black_box(page)).unwrap()));
    group.bench_function("array", |b| b.iter(|| links.matches(black_box(page)).unwrap()));
    group.finish();
}

fn compression_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_compression");
    let envelope = format!(
        "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\"><soap:Body>{}</soap:Body></soap:Envelope>",
        "<Echo xmlns=\"urn:calc\"><text>hello</text></Echo>".repeat(64)
    );

    for encoding in [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br] {
        group.bench_with_input(
            BenchmarkId::from_parameter(encoding),
            &envelope,
            |b, envelope| {
                b.iter(|| compress(black_box(envelope.as_bytes().to_vec()), Some(encoding)).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    url_escape_benchmark,
    query_parse_benchmark,
    pattern_match_benchmark,
    compression_benchmark
);
criterion_main!(benches);
