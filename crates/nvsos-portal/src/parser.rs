//! Entity detail page extraction.
//!
//! Fields are located by their label text and officer columns by their header
//! text, so reordered portal markup does not shift values between fields.

use nvsos_core::{EntityRecord, Officer, RegisteredAgent};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::{element_text, normalize_label, text_or_none, SEARCH_FORM_MARKER};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("page does not match any known entity detail template")]
    UnrecognizedTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Entity,
    Agent,
    Other,
}

const AGENT_ONLY_LABELS: &[&str] = &[
    "name of individual or legal entity",
    "registered agent type",
    "cra agent entity type",
];

struct LabeledField {
    section: Section,
    label: String,
    value: Option<String>,
}

/// Parse an entity detail page. Pure: the same markup always yields the same record.
///
/// Individual fields that are missing or empty come back as `None`; only a page
/// with neither recognised labels nor an officer table is an error.
pub fn parse_entity_page(html: &str) -> Result<EntityRecord, ParseError> {
    let document = Html::parse_document(html);
    if Selector::parse(SEARCH_FORM_MARKER)
        .map(|sel| document.select(&sel).next().is_some())
        .unwrap_or(false)
    {
        return Err(ParseError::UnrecognizedTemplate);
    }
    let fields = collect_labeled_fields(&document);
    let officers = parse_officer_table(&document);

    let mut record = EntityRecord::default();
    let mut agent = RegisteredAgent::default();
    let mut recognised = 0usize;

    for field in fields {
        let matched = match field.section {
            Section::Entity => apply_entity_field(&mut record, &field.label, field.value),
            Section::Agent => apply_agent_field(&mut agent, &field.label, field.value),
            Section::Other => false,
        };
        if matched {
            recognised += 1;
        }
    }

    if recognised == 0 && officers.is_none() {
        return Err(ParseError::UnrecognizedTemplate);
    }

    if !agent.is_empty() {
        record.registered_agent = Some(agent);
    }
    record.officers = officers.unwrap_or_default();
    Ok(record)
}

fn collect_labeled_fields(document: &Html) -> Vec<LabeledField> {
    let (Ok(panel_sel), Ok(label_sel)) = (
        Selector::parse("div.panel-body"),
        Selector::parse("label.control-label"),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut section = Section::Entity;
    for panel in document.select(&panel_sel) {
        if is_nested_panel(panel) {
            continue;
        }
        if let Some(next) = panel_heading(panel).and_then(|h| section_for_heading(&h)) {
            section = next;
        }
        for label in panel.select(&label_sel) {
            let name = normalize_label(&element_text(label));
            if section != Section::Other && AGENT_ONLY_LABELS.contains(&name.as_str()) {
                section = Section::Agent;
            }
            out.push(LabeledField {
                section,
                label: name,
                value: label_value(label),
            });
        }
    }
    out
}

fn is_nested_panel(panel: ElementRef<'_>) -> bool {
    panel
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|el| el.value().name() == "div" && el.value().classes().any(|c| c == "panel-body"))
}

fn panel_heading(panel: ElementRef<'_>) -> Option<String> {
    panel
        .prev_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .filter(|el| el.value().classes().any(|c| c == "panel-heading"))
        .map(element_text)
}

fn section_for_heading(heading: &str) -> Option<Section> {
    let heading = heading.to_ascii_lowercase();
    if heading.contains("registered agent") {
        Some(Section::Agent)
    } else if heading.contains("officer") || heading.contains("principal") {
        Some(Section::Other)
    } else if heading.contains("entity") {
        Some(Section::Entity)
    } else {
        None
    }
}

/// The value column paired with a label: the label's own next sibling, or the
/// column after the label's wrapper.
fn label_value(label: ElementRef<'_>) -> Option<String> {
    let sibling = label
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() != "label" && el.value().name() != "br");
    let container = match sibling {
        Some(el) => Some(el),
        None => label
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|wrapper| wrapper.next_siblings().filter_map(ElementRef::wrap).next())
            .filter(|el| !contains_label(*el)),
    }?;
    text_or_none(element_text(container)).or_else(|| input_value(container))
}

fn contains_label(element: ElementRef<'_>) -> bool {
    Selector::parse("label.control-label")
        .map(|sel| element.select(&sel).next().is_some())
        .unwrap_or(false)
}

fn input_value(element: ElementRef<'_>) -> Option<String> {
    if element.value().name() == "input" {
        return element
            .value()
            .attr("value")
            .and_then(|v| text_or_none(v.to_string()));
    }
    let sel = Selector::parse("input[value]").ok()?;
    element
        .select(&sel)
        .next()
        .and_then(|input| input.value().attr("value"))
        .and_then(|v| text_or_none(v.to_string()))
}

fn set_once(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn apply_entity_field(record: &mut EntityRecord, label: &str, value: Option<String>) -> bool {
    let slot = match label {
        "entity name" => &mut record.entity_name,
        "entity number" => &mut record.entity_number,
        "entity type" => &mut record.entity_type,
        "entity status" => &mut record.entity_status,
        "formation date" => &mut record.formation_date,
        "nv business id" => &mut record.nv_business_id,
        "termination date" => &mut record.termination_date,
        "annual report due date" => &mut record.annual_report_due_date,
        "compliance hold" => &mut record.compliance_hold,
        _ => return false,
    };
    set_once(slot, value);
    true
}

fn apply_agent_field(agent: &mut RegisteredAgent, label: &str, value: Option<String>) -> bool {
    let slot = match label {
        "name of individual or legal entity" => &mut agent.name,
        "status" => &mut agent.status,
        "registered agent type" => &mut agent.agent_type,
        "cra agent entity type" => &mut agent.cra_agent_entity_type,
        "nv business id" => &mut agent.nv_business_id,
        "office or position" => &mut agent.office_or_position,
        "jurisdiction" => &mut agent.jurisdiction,
        "street address" => &mut agent.street_address,
        "mailing address" => &mut agent.mailing_address,
        _ => return false,
    };
    set_once(slot, value);
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OfficerColumns {
    title: Option<usize>,
    name: Option<usize>,
    address: Option<usize>,
    last_updated: Option<usize>,
    status: Option<usize>,
}

impl OfficerColumns {
    /// Column order of the principal grid when no header row is present.
    const POSITIONAL: Self = Self {
        title: Some(0),
        name: Some(1),
        address: Some(2),
        last_updated: Some(3),
        status: Some(4),
    };

    fn from_headers(headers: &[String]) -> Option<Self> {
        let mut columns = Self {
            title: None,
            name: None,
            address: None,
            last_updated: None,
            status: None,
        };
        for (idx, header) in headers.iter().enumerate() {
            let header = header.to_ascii_lowercase();
            let slot = if header.contains("title") {
                &mut columns.title
            } else if header.contains("updated") {
                &mut columns.last_updated
            } else if header.contains("address") {
                &mut columns.address
            } else if header.contains("status") {
                &mut columns.status
            } else if header.contains("name") {
                &mut columns.name
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = Some(idx);
            }
        }
        (columns.title.is_some() || columns.name.is_some()).then_some(columns)
    }

    fn officer(&self, cells: &[Option<String>]) -> Officer {
        let cell = |idx: Option<usize>| idx.and_then(|i| cells.get(i).cloned().flatten());
        Officer {
            title: cell(self.title),
            name: cell(self.name),
            address: cell(self.address),
            last_updated: cell(self.last_updated),
            status: cell(self.status),
        }
    }
}

/// Officer rows in document order, or `None` when the page has no officer table.
fn parse_officer_table(document: &Html) -> Option<Vec<Officer>> {
    let table = officer_table(document)?;
    let th_sel = Selector::parse("th").ok()?;
    let row_sel = Selector::parse("tr").ok()?;
    let td_sel = Selector::parse("td").ok()?;

    let headers = table
        .select(&th_sel)
        .map(element_text)
        .collect::<Vec<_>>();
    let columns = OfficerColumns::from_headers(&headers).unwrap_or(OfficerColumns::POSITIONAL);

    let officers = table
        .select(&row_sel)
        .filter_map(|row| {
            let cells = row
                .select(&td_sel)
                .map(|td| text_or_none(element_text(td)))
                .collect::<Vec<_>>();
            // Placeholder rows ("No records") span the table in a single cell.
            if cells.len() < 2 {
                return None;
            }
            let officer = columns.officer(&cells);
            (!officer.is_empty()).then_some(officer)
        })
        .collect();
    Some(officers)
}

fn officer_table(document: &Html) -> Option<ElementRef<'_>> {
    let by_id = Selector::parse("table#grid_principalList").ok()?;
    if let Some(table) = document.select(&by_id).next() {
        return Some(table);
    }
    let tables = Selector::parse("table").ok()?;
    let th_sel = Selector::parse("th").ok()?;
    document.select(&tables).find(|table| {
        let headers = table
            .select(&th_sel)
            .map(|th| element_text(th).to_ascii_lowercase())
            .collect::<Vec<_>>();
        headers.iter().any(|h| h.contains("title")) && headers.iter().any(|h| h.contains("name"))
    })
}
