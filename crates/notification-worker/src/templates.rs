//! 邮件模板
//!
//! 即时邮件与摘要邮件的主题和 HTML 正文。推送文案由各通知变体自行渲染，
//! 这里只负责邮件。

use chrono::{DateTime, Datelike, Duration, Utc};
use serde_json::Value;

use crate::settings::EmailFrequency;

/// 摘要中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct DigestLine {
    pub text: String,
    /// 同组中未单独展示的条数
    pub additional: usize,
}

/// 邮件主题，数量取窗口内的通知总数而不是展示的条数
///
/// - live: `N unread notification(s)`
/// - daily: `N unread notification(s) from January 1st 2024`
/// - weekly: `N unread notification(s) from January 1st - January 8th 2024`
pub fn digest_subject(frequency: EmailFrequency, count: usize, now: DateTime<Utc>) -> String {
    let noun = if count == 1 { "notification" } else { "notifications" };
    let base = format!("{count} unread {noun}");
    match frequency {
        EmailFrequency::Daily => {
            let start = now - Duration::days(1);
            format!("{base} from {} {}", month_day(start), start.year())
        }
        EmailFrequency::Weekly => {
            let start = now - Duration::days(7);
            format!(
                "{base} from {} - {} {}",
                month_day(start),
                month_day(now),
                now.year()
            )
        }
        EmailFrequency::Live | EmailFrequency::Off => base,
    }
}

fn month_day(date: DateTime<Utc>) -> String {
    let day = date.day();
    let suffix = match (day % 10, day % 100) {
        (1, n) if n != 11 => "st",
        (2, n) if n != 12 => "nd",
        (3, n) if n != 13 => "rd",
        _ => "th",
    };
    format!("{} {day}{suffix}", date.format("%B"))
}

/// 单条通知的即时邮件
pub fn render_live_email(title: &str, body: &str) -> String {
    format!(
        "<html><body><h2>{}</h2><p>{}</p></body></html>",
        escape_html(title),
        escape_html(body)
    )
}

/// 摘要邮件正文
pub fn render_digest(lines: &[DigestLine], total: usize) -> String {
    let mut html = String::from("<html><body>");
    html.push_str(&format!(
        "<h2>You have {total} unread {}</h2><ul>",
        if total == 1 { "notification" } else { "notifications" }
    ));
    for line in lines {
        html.push_str("<li>");
        html.push_str(&escape_html(&line.text));
        if line.additional > 0 {
            html.push_str(&format!(
                " <small>and {} other{}</small>",
                line.additional,
                if line.additional == 1 { "" } else { "s" }
            ));
        }
        html.push_str("</li>");
    }
    html.push_str("</ul>");
    let shown: usize = lines.iter().map(|l| 1 + l.additional).sum();
    if total > shown {
        html.push_str(&format!("<p>and {} more in the app</p>", total - shown));
    }
    html.push_str("</body></html>");
    html
}

/// 摘要中一条应用通知的文案
///
/// `actor` 为触发者名称，载荷中缺少的字段用占位符代替。
pub fn describe_notification(notification_type: &str, actor: &str, data: &Value) -> String {
    let entity = extract_str(data, "type", "track").to_lowercase();
    match notification_type {
        "follow" => format!("{actor} followed you"),
        "repost" => format!("{actor} reposted your {entity}"),
        "save" => format!("{actor} favorited your {entity}"),
        "comment" => format!("{actor} commented on your {entity}"),
        "tip_receive" => format!("{actor} sent you a tip"),
        "usdc_purchase_seller" => format!("{actor} bought your {}", extract_str(data, "content_type", "track")),
        "remix" => "Your track was remixed".to_string(),
        "milestone" => format!(
            "You reached a milestone of {}",
            extract_str(data, "threshold", "?")
        ),
        other => format!("New {other} notification"),
    }
}

/// 摘要中一位私信发送者的文案
pub fn describe_message(sender: &str, is_reaction: bool, multiple: bool) -> String {
    match (is_reaction, multiple) {
        (false, false) => format!("{sender} sent you a new message"),
        (false, true) => format!("{sender} sent you new messages"),
        (true, false) => format!("{sender} reacted to your message"),
        (true, true) => format!("{sender} reacted to your messages"),
    }
}

fn extract_str(data: &Value, key: &str, default: &str) -> String {
    data.get(key)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| default.to_string())
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_live_subject_pluralisation() {
        assert_eq!(
            digest_subject(EmailFrequency::Live, 1, now()),
            "1 unread notification"
        );
        assert_eq!(
            digest_subject(EmailFrequency::Live, 3, now()),
            "3 unread notifications"
        );
    }

    #[test]
    fn test_daily_and_weekly_subjects() {
        assert_eq!(
            digest_subject(EmailFrequency::Daily, 2, now()),
            "2 unread notifications from January 7th 2024"
        );
        assert_eq!(
            digest_subject(EmailFrequency::Weekly, 12, now()),
            "12 unread notifications from January 1st - January 8th 2024"
        );
    }

    #[test]
    fn test_ordinals() {
        let day = |d| Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap();
        assert_eq!(month_day(day(2)), "March 2nd");
        assert_eq!(month_day(day(3)), "March 3rd");
        assert_eq!(month_day(day(11)), "March 11th");
        assert_eq!(month_day(day(22)), "March 22nd");
    }

    #[test]
    fn test_digest_escapes_and_counts_additional() {
        let lines = vec![
            DigestLine {
                text: "<b>user_2</b> followed you".into(),
                additional: 2,
            },
            DigestLine {
                text: "user_3 favorited your track".into(),
                additional: 0,
            },
        ];
        let html = render_digest(&lines, 6);
        assert!(html.contains("&lt;b&gt;user_2&lt;/b&gt; followed you"));
        assert!(html.contains("and 2 others"));
        assert!(html.contains("and 2 more in the app"));
    }

    #[test]
    fn test_describe_uses_payload_fields() {
        let data = serde_json::json!({"type": "playlist", "user_id": 2});
        assert_eq!(
            describe_notification("repost", "user_2", &data),
            "user_2 reposted your playlist"
        );
        assert_eq!(
            describe_notification("milestone", "", &serde_json::json!({"threshold": 10})),
            "You reached a milestone of 10"
        );
        assert_eq!(describe_message("user_5", false, true), "user_5 sent you new messages");
    }
}
