//! Surface extraction: raw `(key, value)` pairs out of page data.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::sync::OnceLock;

use crate::fetch::{PageData, PdfBlock};
use crate::identity::SourceIdentity;

use super::types::{RawExtraction, Surface};

/// Leaves extracted per JSON blob before truncation.
const MAX_JSON_LEAVES: usize = 400;

/// Keys that inherit a section label from spanning table headers.
const DIMENSION_KEYS: &[&str] = &["width", "height", "depth", "length", "weight", "diameter"];

fn is_dimension_key(key: &str) -> bool {
    DIMENSION_KEYS.contains(&key.trim().to_ascii_lowercase().as_str())
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(inches|inch|in|cm|lbs|lb|oz)\b").expect("static regex")
    })
}

/// Convert imperial/metric-prefixed dimension units to the canonical base
/// (mm, g) in place.
pub fn normalize_units_in_place(raw: &str) -> String {
    unit_re()
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let number: f64 = caps[1].parse().unwrap_or(0.0);
            let (converted, unit) = match caps[2].to_ascii_lowercase().as_str() {
                "in" | "inch" | "inches" => (number * 25.4, "mm"),
                "cm" => (number * 10.0, "mm"),
                "lb" | "lbs" => (number * 453.592, "g"),
                "oz" => (number * 28.3495, "g"),
                _ => return caps[0].to_string(),
            };
            if converted.fract().abs() < 0.05 {
                format!("{} {}", converted.round() as i64, unit)
            } else {
                format!("{converted:.1} {unit}")
            }
        })
        .to_string()
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cell_rowspan(cell: &ElementRef<'_>) -> u32 {
    cell.value()
        .attr("rowspan")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Extract table rows and definition lists from an HTML body.
fn extract_html(html: &str, out: &mut Vec<RawExtraction>) {
    let document = Html::parse_document(html);
    let (Ok(table_sel), Ok(tr_sel), Ok(cell_sel), Ok(dl_sel)) = (
        Selector::parse("table"),
        Selector::parse("tr"),
        Selector::parse("th, td"),
        Selector::parse("dl"),
    ) else {
        return;
    };

    for (table_id, table) in document.select(&table_sel).enumerate() {
        // (label, rows it still covers) for rowspan section headers
        let mut section: Option<(String, u32)> = None;
        for (row_id, row) in table.select(&tr_sel).enumerate() {
            let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
            if cells.is_empty() {
                continue;
            }
            if cells.len() == 1 {
                let label = cell_text(&cells[0]);
                if !label.is_empty() {
                    section = Some((label, u32::MAX));
                }
                continue;
            }

            let mut cells = cells;
            let spanning = cell_rowspan(&cells[0]) > 1;
            if spanning {
                let label = cell_text(&cells[0]);
                let span = cell_rowspan(&cells[0]);
                section = Some((label, span));
                cells.remove(0);
            } else {
                let expired = match section.as_mut() {
                    Some((_, remaining)) if *remaining != u32::MAX => {
                        *remaining = remaining.saturating_sub(1);
                        *remaining == 0
                    }
                    _ => false,
                };
                if expired {
                    section = None;
                }
            }

            if cells.len() < 2 {
                continue;
            }
            let key = cell_text(&cells[0]);
            let value = cells[1..]
                .iter()
                .map(cell_text)
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if key.is_empty() || value.is_empty() {
                continue;
            }

            let section_label = section.as_ref().map(|(label, _)| label.clone());
            let key = match (&section_label, is_dimension_key(&key)) {
                (Some(label), true) => format!("{label} {key}"),
                _ => key,
            };

            out.push(RawExtraction {
                key,
                value: normalize_units_in_place(&value),
                surface: Surface::HtmlTable {
                    table_id: table_id as u32,
                    row_id: row_id as u32,
                },
                section: section_label,
            });
        }
    }

    let (Ok(dt_sel), Ok(dd_sel)) = (Selector::parse("dt"), Selector::parse("dd")) else {
        return;
    };
    for dl in document.select(&dl_sel) {
        let terms: Vec<String> = dl.select(&dt_sel).map(|e| cell_text(&e)).collect();
        let defs: Vec<String> = dl.select(&dd_sel).map(|e| cell_text(&e)).collect();
        for (row_id, (key, value)) in terms.into_iter().zip(defs).enumerate() {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            out.push(RawExtraction {
                key,
                value: normalize_units_in_place(&value),
                surface: Surface::DefinitionList {
                    row_id: row_id as u32,
                },
                section: None,
            });
        }
    }
}

/// Flatten a JSON value into `(path, leaf_key, rendered_value)` triples.
fn flatten_json(prefix: &str, value: &Value, out: &mut Vec<(String, String, String)>) {
    if out.len() >= MAX_JSON_LEAVES {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_json(&path, child, out);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten_json(&format!("{prefix}[{idx}]"), child, out);
            }
        }
        Value::Null => {}
        scalar => {
            let rendered = match scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let leaf = prefix
                .rsplit('.')
                .next()
                .unwrap_or(prefix)
                .split('[')
                .next()
                .unwrap_or(prefix)
                .to_string();
            out.push((prefix.to_string(), leaf, rendered));
        }
    }
}

fn extract_json_surface<F>(blob: &Value, make_surface: F, out: &mut Vec<RawExtraction>)
where
    F: Fn(String) -> Surface,
{
    let mut leaves = Vec::new();
    flatten_json("", blob, &mut leaves);
    for (path, key, value) in leaves {
        if value.trim().is_empty() {
            continue;
        }
        out.push(RawExtraction {
            key,
            value,
            surface: make_surface(path),
            section: None,
        });
    }
}

fn extract_pdf(blocks: &[PdfBlock], out: &mut Vec<RawExtraction>) {
    for block in blocks {
        match block {
            PdfBlock::Table { page, rows } => {
                for row in rows {
                    if row.len() < 2 {
                        continue;
                    }
                    let key = row[0].trim().to_string();
                    let value = row[1..].join(" ").trim().to_string();
                    if key.is_empty() || value.is_empty() {
                        continue;
                    }
                    out.push(RawExtraction {
                        key,
                        value: normalize_units_in_place(&value),
                        surface: Surface::PdfTable { page: *page },
                        section: None,
                    });
                }
            }
            PdfBlock::KeyValue { page, pairs } => {
                for (key, value) in pairs {
                    if key.trim().is_empty() || value.trim().is_empty() {
                        continue;
                    }
                    out.push(RawExtraction {
                        key: key.trim().to_string(),
                        value: normalize_units_in_place(value.trim()),
                        surface: Surface::PdfKeyValue { page: *page },
                        section: None,
                    });
                }
            }
        }
    }
}

/// Pull every supported surface out of one page.
pub fn extract_surfaces(page: &PageData) -> Vec<RawExtraction> {
    let mut out = Vec::new();

    if let Some(html) = &page.html {
        extract_html(html, &mut out);
    }
    for blob in &page.ldjson_blocks {
        extract_json_surface(blob, |path| Surface::JsonLd { path }, &mut out);
    }
    for blob in &page.embedded_state {
        extract_json_surface(blob, |path| Surface::EmbeddedState { path }, &mut out);
    }
    for response in &page.network_responses {
        let endpoint = response.url.clone();
        extract_json_surface(
            &response.body,
            |path| Surface::NetworkJson {
                endpoint: endpoint.clone(),
                path,
            },
            &mut out,
        );
    }
    extract_pdf(&page.pdf_blocks, &mut out);

    out
}

/// Derive what the page claims about its own identity: JSON-LD product
/// fields first, table rows second, title as the fallback haystack.
pub fn derive_source_identity(page: &PageData, extractions: &[RawExtraction]) -> SourceIdentity {
    let mut identity = SourceIdentity {
        title: page.title.clone(),
        ..SourceIdentity::default()
    };

    for extraction in extractions {
        let key = extraction.key.trim().to_ascii_lowercase();
        let value = extraction.value.trim();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "brand" | "manufacturer" => {
                identity.brand.get_or_insert_with(|| value.to_string());
            }
            "model" | "name" | "product name" | "product" => {
                identity.model.get_or_insert_with(|| value.to_string());
            }
            "sku" | "mpn" | "model number" | "part number" => {
                identity.sku.get_or_insert_with(|| value.to_string());
            }
            _ => {}
        }
    }
    identity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::NetworkResponse;
    use serde_json::json;

    fn page_with_html(html: &str) -> PageData {
        PageData {
            url: "https://a.com/p".into(),
            final_url: "https://a.com/p".into(),
            status: 200,
            html: Some(html.to_string()),
            ..PageData::default()
        }
    }

    #[test]
    fn test_table_rows_extracted() {
        let page = page_with_html(
            r#"<table>
                <tr><th>Weight</th><td>60 g</td></tr>
                <tr><th>Polling Rate</th><td>4000 Hz</td></tr>
            </table>"#,
        );
        let out = extract_surfaces(&page);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, "Weight");
        assert_eq!(out[0].value, "60 g");
        assert!(matches!(out[0].surface, Surface::HtmlTable { .. }));
    }

    #[test]
    fn test_dimension_keys_inherit_rowspan_section() {
        let page = page_with_html(
            r#"<table>
                <tr><th rowspan="2">Mouse</th><th>Width</th><td>63.9 mm</td></tr>
                <tr><th>Weight</th><td>54 g</td></tr>
                <tr><th>DPI</th><td>35000</td></tr>
            </table>"#,
        );
        let out = extract_surfaces(&page);
        let keys: Vec<&str> = out.iter().map(|e| e.key.as_str()).collect();
        assert!(keys.contains(&"Mouse Width"), "keys: {keys:?}");
        assert!(keys.contains(&"Mouse Weight"), "keys: {keys:?}");
        assert!(keys.contains(&"DPI"), "keys: {keys:?}");
    }

    #[test]
    fn test_single_cell_row_sets_section() {
        let page = page_with_html(
            r#"<table>
                <tr><th>Dimensions</th></tr>
                <tr><th>Height</th><td>2.5 cm</td></tr>
            </table>"#,
        );
        let out = extract_surfaces(&page);
        assert_eq!(out[0].key, "Dimensions Height");
        assert_eq!(out[0].value, "25 mm");
    }

    #[test]
    fn test_definition_list_extracted() {
        let page = page_with_html(
            r#"<dl>
                <dt>Sensor</dt><dd>Focus Pro 35K</dd>
                <dt>Weight</dt><dd>1.9 oz</dd>
            </dl>"#,
        );
        let out = extract_surfaces(&page);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, "Sensor");
        assert_eq!(out[1].value, "53.9 g");
    }

    #[test]
    fn test_unit_normalization_in_place() {
        assert_eq!(normalize_units_in_place("2.5 in"), "63.5 mm");
        assert_eq!(normalize_units_in_place("1 lb"), "453.6 g");
        assert_eq!(normalize_units_in_place("5 cm x 3 cm"), "50 mm x 30 mm");
        assert_eq!(normalize_units_in_place("4000 Hz"), "4000 Hz");
    }

    #[test]
    fn test_ldjson_flattened() {
        let mut page = page_with_html("");
        page.ldjson_blocks = vec![json!({
            "@type": "Product",
            "name": "Viper V3 Pro",
            "weight": {"value": 54, "unitCode": "GRM"},
            "offers": [{"price": "159.99"}]
        })];
        let out = extract_surfaces(&page);
        let by_key = |k: &str| out.iter().find(|e| e.key == k).unwrap();
        assert_eq!(by_key("name").value, "Viper V3 Pro");
        assert_eq!(by_key("value").value, "54");
        assert!(matches!(&by_key("price").surface, Surface::JsonLd { path } if path == "offers[0].price"));
    }

    #[test]
    fn test_network_json_surface() {
        let mut page = page_with_html("");
        page.network_responses = vec![NetworkResponse {
            url: "https://a.com/api/product".into(),
            status: 200,
            body: json!({"specs": {"dpi": 32000}}),
        }];
        let out = extract_surfaces(&page);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, "dpi");
        assert_eq!(out[0].value, "32000");
        assert!(matches!(out[0].surface, Surface::NetworkJson { .. }));
    }

    #[test]
    fn test_pdf_blocks() {
        let mut page = page_with_html("");
        page.pdf_blocks = vec![
            PdfBlock::Table {
                page: 2,
                rows: vec![vec!["Weight".into(), "60 g".into()]],
            },
            PdfBlock::KeyValue {
                page: 3,
                pairs: vec![("Battery Life".into(), "95 h".into())],
            },
        ];
        let out = extract_surfaces(&page);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].surface, Surface::PdfTable { page: 2 }));
        assert!(matches!(out[1].surface, Surface::PdfKeyValue { page: 3 }));
    }

    #[test]
    fn test_derive_source_identity() {
        let mut page = page_with_html(
            r#"<table>
                <tr><th>Brand</th><td>Razer</td></tr>
                <tr><th>Model</th><td>Viper V3 Pro</td></tr>
                <tr><th>SKU</th><td>RZ01-05120100</td></tr>
            </table>"#,
        );
        page.title = Some("Viper V3 Pro specs".into());
        let extractions = extract_surfaces(&page);
        let identity = derive_source_identity(&page, &extractions);
        assert_eq!(identity.brand.as_deref(), Some("Razer"));
        assert_eq!(identity.model.as_deref(), Some("Viper V3 Pro"));
        assert_eq!(identity.sku.as_deref(), Some("RZ01-05120100"));
        assert_eq!(identity.title.as_deref(), Some("Viper V3 Pro specs"));
    }
}
