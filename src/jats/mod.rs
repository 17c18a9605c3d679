pub mod markdown;
pub mod math;

use std::collections::BTreeMap;
use std::io::BufRead;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use crate::domain::{ArticleMetadata, Figure, Pmcid, format_publication_date};
use crate::error::HarvestError;

// After this many consecutive reader errors the stream is considered
// unrecoverable and ends.
const MAX_CONSECUTIVE_READER_ERRORS: usize = 20;

/// Owned subtree of one XML element. The streaming parser materializes one
/// `<article>` at a time, so peak memory is bounded by a single article.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone)]
pub enum XmlNode {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Attribute lookup by local name, tolerating namespace prefixes such as
    /// `xlink:href`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name || key.rsplit(':').next() == Some(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|el| el.local_name() == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |el| el.local_name() == name)
    }

    /// Depth-first descendants with the given local name.
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        let mut stack: Vec<&Element> = self.elements().collect();
        stack.reverse();
        while let Some(el) = stack.pop() {
            if el.local_name() == name {
                found.push(el);
            }
            let mut children: Vec<&Element> = el.elements().collect();
            children.reverse();
            stack.extend(children);
        }
        found
    }

    pub fn first_descendant(&self, name: &str) -> Option<&Element> {
        let mut stack: Vec<&Element> = self.elements().collect();
        stack.reverse();
        while let Some(el) = stack.pop() {
            if el.local_name() == name {
                return Some(el);
            }
            let mut children: Vec<&Element> = el.elements().collect();
            children.reverse();
            stack.extend(children);
        }
        None
    }

    /// All text content, concatenated and whitespace-collapsed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        collapse_whitespace(&out)
    }
}

fn collect_text(el: &Element, out: &mut String) {
    for node in &el.children {
        match node {
            XmlNode::Text(text) => out.push_str(text),
            XmlNode::Element(child) => collect_text(child, out),
        }
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Lazy, finite, non-restartable stream of article records over one
/// decompressing package reader. Articles without a resolvable PMCID are
/// skipped silently; a parse failure is yielded as an error for that article
/// only and never aborts the rest of the package.
pub struct ArticleStream<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    consecutive_errors: usize,
    done: bool,
}

impl<R: BufRead> ArticleStream<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().check_end_names = false;
        Self {
            reader,
            buf: Vec::new(),
            consecutive_errors: 0,
            done: false,
        }
    }

    /// Reads events until the matching `</article>`, building an owned tree.
    fn read_article_tree(&mut self, root: Element) -> Result<Element, HarvestError> {
        let mut stack: Vec<Element> = vec![root];
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(ref e)) => {
                    stack.push(element_from_start(e));
                }
                Ok(Event::Empty(ref e)) => {
                    let el = element_from_start(e);
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Element(el));
                    }
                }
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map(|cow| cow.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(e.as_ref()).into_owned());
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(text));
                    }
                }
                Ok(Event::CData(ref e)) => {
                    let text = String::from_utf8_lossy(e.as_ref()).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(text));
                    }
                }
                Ok(Event::End(_)) => {
                    let el = stack.pop().ok_or_else(|| {
                        HarvestError::Parse("unbalanced end tag in article".to_string())
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(XmlNode::Element(el)),
                        None => return Ok(el),
                    }
                }
                Ok(Event::Eof) => {
                    return Err(HarvestError::Parse(
                        "unexpected end of package inside article".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(err) => return Err(HarvestError::Parse(err.to_string())),
            }
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Element {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|cow| cow.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        attrs.push((key, value));
    }
    Element {
        name,
        attrs,
        children: Vec::new(),
    }
}

impl<R: BufRead> Iterator for ArticleStream<R> {
    type Item = Result<ArticleMetadata, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf);
            match event {
                Ok(Event::Start(ref e))
                    if local_name_of(e.name().as_ref()) == b"article" =>
                {
                    let root = element_from_start(e);
                    let tree = match self.read_article_tree(root) {
                        Ok(tree) => tree,
                        Err(err) => {
                            self.consecutive_errors += 1;
                            if self.consecutive_errors > MAX_CONSECUTIVE_READER_ERRORS {
                                self.done = true;
                            }
                            return Some(Err(err));
                        }
                    };
                    self.consecutive_errors = 0;
                    match extract_article(&tree) {
                        Ok(Some(article)) => return Some(Ok(article)),
                        Ok(None) => {
                            debug!("skipping article without resolvable PMCID");
                            continue;
                        }
                        Err(err) => return Some(Err(err)),
                    }
                }
                Ok(Event::Eof) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!("XML reader error between articles: {err}");
                    self.consecutive_errors += 1;
                    if self.consecutive_errors > MAX_CONSECUTIVE_READER_ERRORS {
                        self.done = true;
                        return None;
                    }
                    return Some(Err(HarvestError::Parse(err.to_string())));
                }
            }
        }
    }
}

fn local_name_of(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|b| *b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    }
}

/// Pulls metadata and the Markdown body out of one article tree. Returns
/// `Ok(None)` when no PMCID can be resolved.
pub fn extract_article(article: &Element) -> Result<Option<ArticleMetadata>, HarvestError> {
    let front = article.child("front");
    let article_meta = front.and_then(|f| f.child("article-meta"));

    let Some(meta) = article_meta else {
        return Ok(None);
    };

    let Some(pmcid) = resolve_pmcid(meta) else {
        return Ok(None);
    };

    let mut record = ArticleMetadata {
        pmcid: pmcid.as_str().to_string(),
        ..ArticleMetadata::default()
    };

    for id in meta.children_named("article-id") {
        match id.attr("pub-id-type") {
            Some("pmid") => record.pmid = Some(id.text()),
            Some("doi") => record.doi = Some(id.text()),
            _ => {}
        }
    }

    if let Some(title) = meta
        .child("title-group")
        .and_then(|group| group.child("article-title"))
    {
        record.title = title.text();
    }

    if let Some(abstract_el) = meta.child("abstract") {
        let text = abstract_el.text();
        if !text.is_empty() {
            record.abstract_text = Some(text);
        }
    }

    record.authors = extract_authors(meta);
    record.journal = front
        .and_then(|f| f.child("journal-meta"))
        .and_then(|jm| jm.first_descendant("journal-title"))
        .map(|title| title.text());

    if let Some((date, year)) = extract_publication_date(meta) {
        record.publication_date = Some(date);
        record.year = Some(year);
    }

    record.license_url = extract_license_url(meta);
    (record.keywords, record.mesh_terms) = extract_keywords(meta);
    record.figures = extract_figures(article);

    if let Some(body) = article.child("body") {
        record.full_text = markdown::body_to_markdown(body);
    }

    Ok(Some(record))
}

/// PMCID is carried under either `pub-id-type="pmcid"` or `"pmc"`.
fn resolve_pmcid(meta: &Element) -> Option<Pmcid> {
    for id_type in ["pmcid", "pmc"] {
        for id in meta.children_named("article-id") {
            if id.attr("pub-id-type") == Some(id_type) {
                if let Ok(pmcid) = id.text().parse() {
                    return Some(pmcid);
                }
            }
        }
    }
    None
}

fn extract_authors(meta: &Element) -> Vec<String> {
    let mut authors = Vec::new();
    for group in meta.children_named("contrib-group") {
        for contrib in group.children_named("contrib") {
            if let Some(kind) = contrib.attr("contrib-type") {
                if kind != "author" {
                    continue;
                }
            }
            let Some(name) = contrib.child("name") else {
                continue;
            };
            let surname = name.child("surname").map(|el| el.text()).unwrap_or_default();
            let given = name
                .child("given-names")
                .map(|el| el.text())
                .unwrap_or_default();
            let formatted = match (surname.is_empty(), given.is_empty()) {
                (false, false) => format!("{surname} {given}"),
                (false, true) => surname,
                (true, false) => given,
                (true, true) => continue,
            };
            authors.push(formatted);
        }
    }
    authors
}

fn extract_publication_date(meta: &Element) -> Option<(String, i32)> {
    // Prefer the electronic publication date, then any other pub-date.
    let dates: Vec<&Element> = meta.children_named("pub-date").collect();
    let chosen = dates
        .iter()
        .find(|d| matches!(d.attr("pub-type"), Some("epub") | Some("ppub")))
        .or_else(|| dates.first())?;
    let year: i32 = chosen.child("year")?.text().parse().ok()?;
    let month: u32 = chosen
        .child("month")
        .and_then(|el| el.text().parse().ok())
        .unwrap_or(1);
    let day: u32 = chosen
        .child("day")
        .and_then(|el| el.text().parse().ok())
        .unwrap_or(1);
    Some((format_publication_date(year, month, day), year))
}

fn extract_license_url(meta: &Element) -> Option<String> {
    let license = meta
        .child("permissions")
        .and_then(|perm| perm.child("license"))?;
    if let Some(href) = license.attr("href") {
        return Some(href.to_string());
    }
    license
        .descendants("ext-link")
        .into_iter()
        .find_map(|link| link.attr("href").map(|href| href.to_string()))
}

/// Keywords come from kwd-groups; groups typed as MeSH feed mesh_terms.
fn extract_keywords(meta: &Element) -> (Vec<String>, Vec<String>) {
    let mut keywords = Vec::new();
    let mut mesh_terms = Vec::new();
    for group in meta.children_named("kwd-group") {
        let is_mesh = group
            .attr("kwd-group-type")
            .map(|ty| ty.to_ascii_lowercase().contains("mesh"))
            .unwrap_or(false);
        for kwd in group.descendants("kwd") {
            let term = kwd.text();
            if term.is_empty() {
                continue;
            }
            if is_mesh {
                mesh_terms.push(term);
            } else {
                keywords.push(term);
            }
        }
    }
    (keywords, mesh_terms)
}

fn extract_figures(article: &Element) -> BTreeMap<String, Figure> {
    let mut figures = BTreeMap::new();
    for fig in article.descendants("fig") {
        let Some(id) = fig.attr("id") else {
            continue;
        };
        figures.insert(id.to_string(), figure_record(fig));
    }
    figures
}

pub(crate) fn figure_record(fig: &Element) -> Figure {
    let label = fig.child("label").map(|el| el.text()).unwrap_or_default();
    let caption = fig.child("caption").map(|el| el.text()).unwrap_or_default();
    let graphic_ref = fig
        .first_descendant("graphic")
        .and_then(|graphic| graphic.attr("href"))
        .unwrap_or_default()
        .to_string();
    Figure {
        label,
        caption,
        graphic_ref,
    }
}
