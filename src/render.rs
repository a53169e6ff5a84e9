//! Per-category display rules: title, HTML-ish description and map icon.

use serde::Serialize;

use crate::record::{Category, PointRecord};

pub const HYDRANT_ICON: &str = "/icons/hydrant.png";
pub const HYDRANT_UNDERGROUND_ICON: &str = "/icons/hydrant-unterflur.png";
pub const FILL_HYDRANT_ICON: &str = "/icons/hydrant-fuellhydrant.png";
pub const RISK_OBJECT_ICON: &str = "/icons/risiko.svg";
pub const DANGER_OBJECT_ICON: &str = "/icons/gefahr.svg";
pub const POND_ICON: &str = "/icons/loeschteich.png";
pub const SUCTION_POINT_ICON: &str = "/icons/saugstelle.png";

/// Leaflet-style icon options, serialized with the field names map clients expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Icon {
    pub icon_url: String,
    pub icon_size: [u32; 2],
    pub icon_anchor: [i32; 2],
    pub popup_anchor: [i32; 2],
}

impl Icon {
    fn pin(url: &str) -> Self {
        Self {
            icon_url: url.to_string(),
            icon_size: [26, 31],
            icon_anchor: [13, 28],
            popup_anchor: [0, -28],
        }
    }

    fn square(url: &str, size: u32) -> Self {
        let half = (size / 2) as i32;
        Self {
            icon_url: url.to_string(),
            icon_size: [size, size],
            icon_anchor: [half, half],
            popup_anchor: [0, -half],
        }
    }
}

pub trait CategoryRenderer: Sync {
    fn title(&self, record: &PointRecord) -> String;
    fn description(&self, record: &PointRecord) -> String;
    fn icon(&self, record: &PointRecord) -> Icon;
}

struct HydrantRenderer;
struct RiskObjectRenderer;
struct DangerObjectRenderer;
struct PondRenderer;
struct SuctionPointRenderer;

static HYDRANT: HydrantRenderer = HydrantRenderer;
static RISK_OBJECT: RiskObjectRenderer = RiskObjectRenderer;
static DANGER_OBJECT: DangerObjectRenderer = DangerObjectRenderer;
static POND: PondRenderer = PondRenderer;
static SUCTION_POINT: SuctionPointRenderer = SuctionPointRenderer;

pub fn renderer_for(category: Category) -> &'static dyn CategoryRenderer {
    match category {
        Category::Hydrant => &HYDRANT,
        Category::RiskObject => &RISK_OBJECT,
        Category::DangerObject => &DANGER_OBJECT,
        Category::Pond => &POND,
        Category::SuctionPoint => &SUCTION_POINT,
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// `<b>Label:</b> value unit` lines joined by `<br />`, skipping absent attributes.
fn describe(record: &PointRecord, fields: &[(&str, &str, &str)]) -> String {
    fields
        .iter()
        .filter_map(|(key, label, unit)| {
            record.text(key).map(|value| {
                let value = escape_html(&value);
                if unit.is_empty() {
                    format!("<b>{}:</b> {}", label, value)
                } else {
                    format!("<b>{}:</b> {} {}", label, value, unit)
                }
            })
        })
        .collect::<Vec<_>>()
        .join("<br />")
}

fn name_or(record: &PointRecord, fallback: &str) -> String {
    record
        .text("name")
        .or_else(|| record.text("bezeichnung"))
        .unwrap_or_else(|| format!("{} {}", fallback, record.id))
}

impl HydrantRenderer {
    fn is_underground(record: &PointRecord) -> bool {
        record
            .text("typ")
            .is_some_and(|t| t.to_lowercase().contains("unterflur"))
    }
}

impl CategoryRenderer for HydrantRenderer {
    fn title(&self, record: &PointRecord) -> String {
        name_or(record, "Hydrant")
    }

    fn description(&self, record: &PointRecord) -> String {
        let mut description = describe(
            record,
            &[
                ("typ", "Typ", ""),
                ("leistung", "Leistung", "l/min"),
                ("dimension", "Dimension", "mm"),
                ("leitungsart", "Leitungsart", ""),
                ("statischer_druck", "Statischer Druck", "bar"),
                ("dynamischer_druck", "Dynamischer Druck", "bar"),
                ("ortschaft", "Ortschaft", ""),
            ],
        );
        if record.flag("fuellhydrant") {
            if !description.is_empty() {
                description.push_str("<br />");
            }
            description.push_str("<b>Füllhydrant</b>");
        }
        description
    }

    fn icon(&self, record: &PointRecord) -> Icon {
        if record.flag("fuellhydrant") {
            Icon::pin(FILL_HYDRANT_ICON)
        } else if Self::is_underground(record) {
            Icon::pin(HYDRANT_UNDERGROUND_ICON)
        } else {
            Icon::pin(HYDRANT_ICON)
        }
    }
}

impl CategoryRenderer for RiskObjectRenderer {
    fn title(&self, record: &PointRecord) -> String {
        name_or(record, "Risikoobjekt")
    }

    fn description(&self, record: &PointRecord) -> String {
        let mut description = describe(
            record,
            &[
                ("risikogruppe", "Risikogruppe", ""),
                ("adresse", "Adresse", ""),
                ("ortschaft", "Ortschaft", ""),
            ],
        );
        if let Some(link) = record.text("einsatzplan") {
            if !description.is_empty() {
                description.push_str("<br />");
            }
            description.push_str(&format!(
                "<a href=\"{}\" target=\"_blank\">Einsatzplan</a>",
                escape_html(&link)
            ));
        }
        description
    }

    fn icon(&self, _record: &PointRecord) -> Icon {
        Icon::square(RISK_OBJECT_ICON, 24)
    }
}

impl CategoryRenderer for DangerObjectRenderer {
    fn title(&self, record: &PointRecord) -> String {
        name_or(record, "Gefahrobjekt")
    }

    fn description(&self, record: &PointRecord) -> String {
        describe(
            record,
            &[
                ("adresse", "Adresse", ""),
                ("ortschaft", "Ortschaft", ""),
                ("gefahren", "Gefahren", ""),
                ("telefonnummer", "Telefon", ""),
            ],
        )
    }

    fn icon(&self, _record: &PointRecord) -> Icon {
        Icon::square(DANGER_OBJECT_ICON, 24)
    }
}

impl CategoryRenderer for PondRenderer {
    fn title(&self, record: &PointRecord) -> String {
        name_or(record, "Löschteich")
    }

    fn description(&self, record: &PointRecord) -> String {
        describe(
            record,
            &[
                ("fassungsvermoegen", "Fassungsvermögen", "m³"),
                ("zufluss", "Zufluss", "l/min"),
                ("ortschaft", "Ortschaft", ""),
            ],
        )
    }

    fn icon(&self, _record: &PointRecord) -> Icon {
        Icon::square(POND_ICON, 26)
    }
}

impl CategoryRenderer for SuctionPointRenderer {
    fn title(&self, record: &PointRecord) -> String {
        name_or(record, "Saugstelle")
    }

    fn description(&self, record: &PointRecord) -> String {
        describe(
            record,
            &[
                ("wasserentnahme", "Wasserentnahme", "l/min"),
                ("saughoehe", "Saughöhe", "m"),
                ("ortschaft", "Ortschaft", ""),
            ],
        )
    }

    fn icon(&self, _record: &PointRecord) -> Icon {
        Icon::square(SUCTION_POINT_ICON, 26)
    }
}
