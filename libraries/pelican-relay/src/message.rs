//! RFC-5322 envelope construction for outgoing tasks: standard headers, the
//! user-supplied header map, and a single UTF-8 text part.

use chrono::Utc;
use pelican_structs::task::SendTask;

/// Strip header-breaking control characters from a user-supplied value.
fn sanitize(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Convert any line-ending convention to CRLF.
pub fn normalize_crlf(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    unified.replace('\n', "\r\n")
}

/// Prefix an extra dot to every line that starts with one (RFC 5321
/// §4.5.2). Expects CRLF line endings.
pub fn dot_stuff(data: &str) -> String {
    data.split("\r\n")
        .map(|line| {
            if line.starts_with('.') {
                format!(".{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Build the full message: `From`, `To` (first recipient), `Cc` (the rest),
/// `Subject`, `Date` (RFC 1123 with numeric zone), `Message-ID`
/// (`<task-id@relay-host>`), user headers, `Content-Type`, blank line, body.
pub fn format_message(task: &SendTask, message_id_host: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("From: {}\r\n", task.sender));
    if let Some(first) = task.recipients.first() {
        out.push_str(&format!("To: {first}\r\n"));
    }
    if task.recipients.len() > 1 {
        let cc: Vec<String> = task.recipients[1..].iter().map(|r| r.to_string()).collect();
        out.push_str(&format!("Cc: {}\r\n", cc.join(", ")));
    }
    out.push_str(&format!("Subject: {}\r\n", sanitize(&task.subject)));
    out.push_str(&format!(
        "Date: {}\r\n",
        Utc::now().format("%a, %d %b %Y %H:%M:%S %z")
    ));
    out.push_str(&format!("Message-ID: <{}@{}>\r\n", task.id, message_id_host));
    for header in &task.headers {
        let name = sanitize(&header.name);
        if name.is_empty() {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", name, sanitize(&header.value)));
    }
    out.push_str("Content-Type: text/plain; charset=UTF-8\r\n");
    out.push_str("\r\n");
    out.push_str(&normalize_crlf(&task.body));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pelican_structs::address::EmailAddress;
    use pelican_structs::header::Header;
    use pelican_structs::task::TaskKind;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).expect("valid address")
    }

    fn task() -> SendTask {
        SendTask::new(
            TaskKind::Outgoing,
            addr("admin@d.test"),
            vec![addr("x@e.test"), addr("y@e.test"), addr("z@e.test")],
            "greetings",
            "line one\nline two",
        )
    }

    #[test]
    fn first_recipient_is_to_rest_are_cc() {
        let rendered = format_message(&task(), "relay.test");
        assert!(rendered.contains("To: x@e.test\r\n"));
        assert!(rendered.contains("Cc: y@e.test, z@e.test\r\n"));
    }

    #[test]
    fn message_id_uses_task_id_and_relay_host() {
        let task = task();
        let rendered = format_message(&task, "relay.test");
        assert!(rendered.contains(&format!("Message-ID: <{}@relay.test>\r\n", task.id)));
    }

    #[test]
    fn body_is_crlf_terminated_after_blank_line() {
        let rendered = format_message(&task(), "relay.test");
        let (_, body) = rendered.split_once("\r\n\r\n").expect("header/body split");
        assert_eq!(body, "line one\r\nline two");
    }

    #[test]
    fn user_headers_are_sanitized() {
        let task = task().with_headers(vec![Header::new("X-Injected", "a\r\nEvil: yes")]);
        let rendered = format_message(&task, "relay.test");
        assert!(rendered.contains("X-Injected: aEvil: yes\r\n"));
        assert!(!rendered.contains("\r\nEvil: yes\r\n"));
    }

    #[test]
    fn content_type_declares_utf8_text() {
        let rendered = format_message(&task(), "relay.test");
        assert!(rendered.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
    }

    #[test]
    fn date_header_uses_numeric_zone() {
        let rendered = format_message(&task(), "relay.test");
        let date_line = rendered
            .lines()
            .find(|l| l.starts_with("Date: "))
            .expect("date header");
        assert!(date_line.ends_with("+0000"));
    }

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        assert_eq!(dot_stuff(".hidden\r\nplain"), "..hidden\r\nplain");
        assert_eq!(dot_stuff("plain\r\n.\r\nmore"), "plain\r\n..\r\nmore");
        assert_eq!(dot_stuff("no dots"), "no dots");
    }

    #[test]
    fn normalize_handles_mixed_endings() {
        assert_eq!(normalize_crlf("a\r\nb\nc\rd"), "a\r\nb\r\nc\r\nd");
    }
}
