use crate::report::RunReport;
use parminer_scanner::extract::Stage;
use parminer_scanner::scope::authority;
use std::collections::HashSet;
use url::Url;

fn on_domain(url: &str, base_domain: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| authority(&u))
        .is_some_and(|a| a == base_domain)
}

/// Shape check run once before the report is persisted. Returns the list of
/// violations; an empty list means the report is valid.
pub fn validate_report(report: &RunReport) -> Vec<String> {
    let mut violations = Vec::new();

    let visited: HashSet<&str> = report.visited.iter().map(String::as_str).collect();
    if visited.len() != report.visited.len() {
        violations.push("visited list contains duplicates".to_string());
    }
    for url in &report.visited {
        if !on_domain(url, &report.base_domain) {
            violations.push(format!("visited URL {} is off {}", url, report.base_domain));
        }
    }

    for page in &report.pages {
        if !visited.contains(page.url.as_str()) {
            violations.push(format!("page {} is missing from the visited list", page.url));
        }
        if !on_domain(&page.url, &report.base_domain) {
            violations.push(format!("page {} is off {}", page.url, report.base_domain));
        }
        for stage in Stage::ALL {
            match page.results.get(&stage) {
                None => violations.push(format!("page {} has no {} result", page.url, stage)),
                Some(result) if result.stage() != stage => violations.push(format!(
                    "page {} stores a {} result under {}",
                    page.url,
                    result.stage(),
                    stage
                )),
                Some(_) => {}
            }
        }
    }

    for error in &report.errors {
        if error.kind.is_empty() {
            violations.push(format!("error entry for {} has no kind", error.url));
        }
    }

    violations
}
