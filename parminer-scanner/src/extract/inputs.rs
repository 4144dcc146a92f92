use super::{ExtractionResult, Extractor, PageContext, Stage, StageOutput};
use crate::error::Result;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

/// A user-editable element found in the DOM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    pub tag: String,
    /// `type` attribute for `<input>`/`<button>`, otherwise the tag kind.
    pub input_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_method: Option<String>,
}

fn attr(element: &ElementRef<'_>, name: &str) -> Option<String> {
    element.value().attr(name).map(str::to_string)
}

fn enclosing_form<'a>(element: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "form")
}

fn is_editable(element: &ElementRef<'_>) -> bool {
    match element.value().name() {
        "input" | "textarea" | "select" | "button" => true,
        _ => element
            .value()
            .attr("contenteditable")
            .is_some_and(|v| !v.eq_ignore_ascii_case("false")),
    }
}

/// Every `input`, `textarea`, `select`, `button` and `contenteditable`
/// element, in document order.
pub fn extract_input_fields(dom: &str) -> Vec<InputField> {
    let document = Html::parse_document(dom);
    let selector = Selector::parse("input, textarea, select, button, [contenteditable]")
        .expect("static selector");
    let option_selector = Selector::parse("option").expect("static selector");

    document
        .select(&selector)
        .filter(is_editable)
        .map(|element| {
            let tag = element.value().name().to_string();
            let input_type = match tag.as_str() {
                "input" => attr(&element, "type")
                    .map(|t| t.to_ascii_lowercase())
                    .unwrap_or_else(|| "text".to_string()),
                "button" => attr(&element, "type")
                    .map(|t| t.to_ascii_lowercase())
                    .unwrap_or_else(|| "submit".to_string()),
                "textarea" | "select" => tag.clone(),
                _ => "contenteditable".to_string(),
            };

            let value = match tag.as_str() {
                "textarea" => Some(element.text().collect::<String>()),
                "input" | "button" => attr(&element, "value"),
                _ => None,
            };

            let options = if tag == "select" {
                element
                    .select(&option_selector)
                    .map(|o| {
                        o.value()
                            .attr("value")
                            .map(str::to_string)
                            .unwrap_or_else(|| o.text().collect::<String>().trim().to_string())
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let form = enclosing_form(&element);

            InputField {
                input_type,
                name: attr(&element, "name"),
                id: attr(&element, "id"),
                placeholder: attr(&element, "placeholder"),
                value,
                options,
                required: element.value().attr("required").is_some(),
                form_action: form.as_ref().and_then(|f| attr(f, "action")),
                form_method: form
                    .as_ref()
                    .map(|f| attr(f, "method").unwrap_or_else(|| "get".to_string()).to_ascii_uppercase()),
                tag,
            }
        })
        .collect()
}

pub struct InputFieldExtractor;

#[async_trait]
impl Extractor for InputFieldExtractor {
    fn stage(&self) -> Stage {
        Stage::InputFields
    }

    async fn extract(&self, page: &PageContext<'_>) -> Result<StageOutput> {
        let fields = extract_input_fields(&page.snapshot.dom);
        Ok(ExtractionResult::InputFields(fields).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_all_editable_elements_in_order() {
        let dom = r#"
            <form action="/login" method="post">
                <input name="user" placeholder="Username" required>
                <input type="password" name="pass">
                <input type="hidden" name="csrf" value="t0k3n">
                <select name="lang"><option value="en">English</option><option>Deutsch</option></select>
                <textarea name="bio">hi</textarea>
                <button>Go</button>
            </form>
            <div contenteditable="true" id="notes"></div>
            <div contenteditable="false" id="locked"></div>
        "#;
        let fields = extract_input_fields(dom);
        let types: Vec<&str> = fields.iter().map(|f| f.input_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["text", "password", "hidden", "select", "textarea", "submit", "contenteditable"]
        );

        let user = &fields[0];
        assert_eq!(user.name.as_deref(), Some("user"));
        assert_eq!(user.placeholder.as_deref(), Some("Username"));
        assert!(user.required);
        assert_eq!(user.form_action.as_deref(), Some("/login"));
        assert_eq!(user.form_method.as_deref(), Some("POST"));

        assert_eq!(fields[2].value.as_deref(), Some("t0k3n"));
        assert_eq!(fields[3].options, vec!["en", "Deutsch"]);
        assert_eq!(fields[4].value.as_deref(), Some("hi"));
        assert_eq!(fields[6].id.as_deref(), Some("notes"));
        assert!(fields[6].form_action.is_none());
    }

    #[test]
    fn form_method_defaults_to_get() {
        let fields = extract_input_fields(r#"<form action="/s"><input name="q"></form>"#);
        assert_eq!(fields[0].form_method.as_deref(), Some("GET"));
    }

    #[test]
    fn empty_dom_has_no_fields() {
        assert!(extract_input_fields("").is_empty());
    }
}
