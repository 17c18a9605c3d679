use super::{Element, XmlNode, collapse_whitespace};

/// Flattens an `inline-formula`/`disp-formula` wrapper into readable text.
/// MathML content is walked structurally; anything else degrades to its
/// text content with glyph substitution.
pub fn flatten_formula(el: &Element) -> String {
    if let Some(math) = el.first_descendant("math") {
        return flatten_math(math);
    }
    substitute_glyphs(&el.text())
}

pub fn flatten_math(math: &Element) -> String {
    collapse_whitespace(&render_node(math))
}

fn render_node(el: &Element) -> String {
    match el.local_name() {
        "mfrac" => {
            let (num, den) = binary_operands(el);
            format!("({num})/({den})")
        }
        "msup" => {
            let (base, sup) = binary_operands(el);
            format!("{base}^{sup}")
        }
        "msub" => {
            let (base, sub) = binary_operands(el);
            format!("{base}_{sub}")
        }
        "msubsup" => {
            let mut parts = operand_iter(el);
            let base = parts.next().unwrap_or_default();
            let sub = parts.next().unwrap_or_default();
            let sup = parts.next().unwrap_or_default();
            format!("{base}_{sub}^{sup}")
        }
        "msqrt" => format!("sqrt({})", render_children(el)),
        "mroot" => {
            let (base, degree) = binary_operands(el);
            format!("root({base}, {degree})")
        }
        "mfenced" => {
            let open = el.attr("open").unwrap_or("(");
            let close = el.attr("close").unwrap_or(")");
            let separator = el.attr("separators").unwrap_or(",");
            let parts: Vec<String> = operand_iter(el).collect();
            format!("{open}{}{close}", parts.join(separator))
        }
        "mover" | "munder" | "munderover" => {
            // Accents and limits flatten to their operands in order.
            operand_iter(el).collect::<Vec<_>>().join(" ")
        }
        "mtable" => {
            let rows: Vec<String> = el
                .children_named("mtr")
                .map(|row| operand_iter(row).collect::<Vec<_>>().join(", "))
                .collect();
            format!("[{}]", rows.join("; "))
        }
        _ => render_children(el),
    }
}

fn render_children(el: &Element) -> String {
    let mut out = String::new();
    for node in &el.children {
        match node {
            XmlNode::Text(text) => out.push_str(&substitute_glyphs(text)),
            XmlNode::Element(child) => out.push_str(&render_node(child)),
        }
    }
    out
}

fn operand_iter(el: &Element) -> impl Iterator<Item = String> + '_ {
    el.elements().map(render_node)
}

fn binary_operands(el: &Element) -> (String, String) {
    let mut parts = operand_iter(el);
    let first = parts.next().unwrap_or_default();
    let second = parts.next().unwrap_or_default();
    (first, second)
}

/// Common math glyphs mapped to ASCII where a sensible equivalent exists.
pub fn substitute_glyphs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2212}' | '\u{2012}' | '\u{2013}' => out.push('-'),
            '\u{00D7}' => out.push('x'),
            '\u{22C5}' | '\u{00B7}' => out.push('*'),
            '\u{2264}' => out.push_str("<="),
            '\u{2265}' => out.push_str(">="),
            '\u{2260}' => out.push_str("!="),
            '\u{00B1}' => out.push_str("+/-"),
            '\u{2192}' => out.push_str("->"),
            '\u{2190}' => out.push_str("<-"),
            '\u{2248}' | '\u{223C}' => out.push('~'),
            '\u{221E}' => out.push_str("inf"),
            '\u{00A0}' | '\u{2009}' | '\u{2002}' | '\u{2003}' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}
