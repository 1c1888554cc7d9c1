//! XML response shaping for the gamestream control plane.
//!
//! Every gamestream response is a `<root>` element carrying a
//! `status_code` attribute and, on failure, a `status_message`. Bodies
//! are small and flat, with the one exception of `applist`'s repeated
//! `<App>` elements, so a tiny writer beats a full XML dependency.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// One XML element: attributes, text children, element children.
#[derive(Debug, Clone, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    text_children: Vec<(String, String)>,
    element_children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.push((name.into(), value.to_string()));
        self
    }

    /// Append `<name>value</name>`.
    pub fn text(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.text_children.push((name.into(), value.to_string()));
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.element_children.push(child);
        self
    }

    fn write(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        if self.text_children.is_empty() && self.element_children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for (name, value) in &self.text_children {
            out.push('<');
            out.push_str(name);
            out.push('>');
            out.push_str(&escape(value));
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        for child in &self.element_children {
            child.write(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        self.write(&mut out);
        out
    }
}

/// `<root status_code="...">` under construction.
pub struct XmlRoot {
    element: Element,
    http_status: StatusCode,
}

impl XmlRoot {
    pub fn new(status_code: u16) -> Self {
        Self {
            element: Element::new("root").attr("status_code", status_code),
            http_status: StatusCode::OK,
        }
    }

    /// Failure root with a diagnostic message. The HTTP status stays 200;
    /// gamestream clients read the embedded `status_code`.
    pub fn error(status_code: u16, message: impl ToString) -> Self {
        Self::new(status_code).attr("status_message", message)
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.element = self.element.attr(name, value);
        self
    }

    pub fn text(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.element = self.element.text(name, value);
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.element = self.element.child(child);
        self
    }

    /// Override the transport-level status (404 fallback and friends).
    pub fn http_status(mut self, status: StatusCode) -> Self {
        self.http_status = status;
        self
    }
}

impl IntoResponse for XmlRoot {
    fn into_response(self) -> Response {
        let body = self.element.to_xml();
        let mut response = (self.http_status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/xml; charset=utf-8"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_self_closing() {
        let xml = Element::new("root").attr("status_code", 404).to_xml();
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><root status_code=\"404\"/>"
        );
    }

    #[test]
    fn text_children_and_escaping() {
        let xml = Element::new("root")
            .attr("status_code", 200)
            .text("hostname", "Host <&> \"quoted\"")
            .to_xml();
        assert!(xml.contains("<hostname>Host &lt;&amp;&gt; &quot;quoted&quot;</hostname>"));
    }

    #[test]
    fn nested_app_elements() {
        let xml = Element::new("root")
            .attr("status_code", 200)
            .child(Element::new("App").text("AppTitle", "Desktop").text("ID", "42"))
            .child(Element::new("App").text("AppTitle", "Steam"))
            .to_xml();
        assert!(xml.contains("<App><AppTitle>Desktop</AppTitle><ID>42</ID></App>"));
        assert!(xml.contains("<App><AppTitle>Steam</AppTitle></App>"));
        assert!(xml.ends_with("</root>"));
    }
}
