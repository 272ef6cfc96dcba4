//! Message bodies for each delivery channel

use crate::delivery::view::AlertView;
use crate::rules::RuleKind;

const FOOTER: &str = "This is an automated alert from your monitoring system.";

pub fn email_subject(view: &AlertView) -> String {
    let prefix = match view.kind {
        RuleKind::Price => "Crypto Alert",
        RuleKind::Metric => "DeFi Alert",
        RuleKind::Prediction => "Prediction Market Alert",
    };
    match view.kind {
        RuleKind::Price => format!(
            "🚨 {}: {} {} {}",
            prefix, view.headline, view.direction, view.threshold_display
        ),
        _ => format!("🚨 {}: {} {}", prefix, view.headline, view.condition()),
    }
}

pub fn email_text(view: &AlertView) -> String {
    let mut body = format!("{}!\n\n{}\n\n", view.title, view.headline);
    for (label, value) in rows(view) {
        body.push_str(&format!("{}: {}\n", label, value));
    }
    body.push_str(&format!("\n{}\n\n{}\n", view.message, FOOTER));
    body
}

pub fn email_html(view: &AlertView) -> String {
    let table: String = rows(view)
        .iter()
        .map(|(label, value)| {
            format!(
                "<tr><td style=\"padding:8px 0;color:#6b7280;\">{}:</td>\
                 <td style=\"padding:8px 0;text-align:right;font-weight:600;\">{}</td></tr>",
                escape_html(label),
                escape_html(value)
            )
        })
        .collect();

    format!(
        "<!DOCTYPE html>\
         <html><head><meta charset=\"UTF-8\"><title>{title}</title></head>\
         <body style=\"font-family:Arial,sans-serif;max-width:600px;margin:0 auto;padding:20px;\">\
         <h1 style=\"margin:0;\">🚨 {title}</h1>\
         <h2>{emoji} {headline}</h2>\
         <table style=\"width:100%;border-collapse:collapse;\">{table}</table>\
         <p>{message}</p>\
         <p style=\"color:#6b7280;font-size:12px;\">{footer}</p>\
         </body></html>",
        title = escape_html(&view.title),
        emoji = view.direction_emoji(),
        headline = escape_html(&view.headline),
        table = table,
        message = escape_html(&view.message),
        footer = FOOTER,
    )
}

/// Telegram `parse_mode=HTML` body
pub fn telegram_html(view: &AlertView) -> String {
    let mut text = format!(
        "🚨 <b>{}</b>\n\n{} <b>{}</b>\n\n",
        escape_html(&view.title),
        view.direction_emoji(),
        escape_html(&view.headline)
    );
    for (label, value) in rows(view) {
        text.push_str(&format!("<b>{}:</b> {}\n", escape_html(&label), escape_html(&value)));
    }
    text.truncate(text.trim_end().len());
    text
}

/// Labelled rows shared by every body
fn rows(view: &AlertView) -> Vec<(String, String)> {
    let mut rows = view.details.clone();
    rows.push((format!("Current {}", view.subject), view.observed_display.clone()));
    rows.push(("Threshold".to_string(), view.threshold_display.clone()));
    rows.push(("Condition".to_string(), view.condition()));
    rows.push(("Time".to_string(), view.timestamp.to_rfc3339()));
    rows
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
