use std::io::{BufReader, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pmc_harvester::jats::ArticleStream;

struct CountingReader<R: Read> {
    inner: R,
    consumed: Arc<AtomicUsize>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.consumed.fetch_add(read, Ordering::Relaxed);
        Ok(read)
    }
}

fn large_article(pmcid: usize, padding: &str) -> String {
    format!(
        r#"<article>
<front><article-meta>
<article-id pub-id-type="pmc">{pmcid}</article-id>
<title-group><article-title>Padded {pmcid}</article-title></title-group>
</article-meta></front>
<body><sec><title>Data</title><p>{padding}</p></sec></body>
</article>"#
    )
}

#[test]
fn stream_consumes_input_lazily() {
    // 50 articles of ~40 KiB each. Pulling the first article must not drag
    // the rest of the package through the reader.
    let padding = "lorem ipsum dolor sit amet ".repeat(1500);
    let mut xml = String::from("<articles>");
    for pmcid in 1..=50 {
        xml.push_str(&large_article(pmcid, &padding));
    }
    xml.push_str("</articles>");
    let total = xml.len();

    let consumed = Arc::new(AtomicUsize::new(0));
    let reader = CountingReader {
        inner: std::io::Cursor::new(xml.into_bytes()),
        consumed: consumed.clone(),
    };
    let mut stream = ArticleStream::new(BufReader::new(reader));

    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.pmcid, "PMC1");
    let after_first = consumed.load(Ordering::Relaxed);
    assert!(
        after_first < total / 10,
        "consumed {after_first} of {total} bytes for the first article"
    );

    // Draining the stream reads everything exactly once.
    let rest = stream.count();
    assert_eq!(rest, 49);
    assert_eq!(consumed.load(Ordering::Relaxed), total);
}

#[test]
fn consecutive_articles_parse_independently() {
    let xml = r#"<articles>
<article><front><article-meta>
<article-id pub-id-type="pmc">1</article-id>
</article-meta></front></article>
<article><front><article-meta>
<article-id pub-id-type="pmc">2</article-id>
</article-meta></front></article>
</articles>"#;
    let articles: Vec<_> =
        ArticleStream::new(std::io::Cursor::new(xml.as_bytes().to_vec())).collect();
    assert_eq!(articles.len(), 2);
    assert!(articles.iter().all(|result| result.is_ok()));
}

#[test]
fn stream_is_finite_on_truncated_input() {
    let xml = r#"<articles>
<article><front><article-meta>
<article-id pub-id-type="pmc">1</article-id>
</article-meta></front></article>
<article><front><article-meta>"#;
    let results: Vec<_> =
        ArticleStream::new(std::io::Cursor::new(xml.as_bytes().to_vec())).collect();
    // One good article, one truncation error, then the stream ends.
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}
