use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Ticket detail fields as returned by the TS detail API client (§4.B),
/// enough to drive both message layouts.
#[derive(Debug, Clone)]
pub struct TicketDetails {
    pub ticket_number: String,
    pub r#type: String,
    pub customer_id: String,
    pub title: String,
    pub lock: String,
    pub state_type: String,
    pub created: String,
    pub url: String,
}

/// `"NEW {customerId}   {type}\nTicket {ticketNumber}\n{title}\n{url}"`
pub fn event_new_plain_text(ticket: &TicketDetails) -> String {
    format!(
        "NEW {}   {}\nTicket {}\n{}\n{}",
        ticket.customer_id, ticket.r#type, ticket.ticket_number, ticket.title, ticket.url
    )
}

/// `"UP {ageMinutes} мин.   {customerId}   {type}\nTicket {ticketNumber}\n{title}\n{url}"`
pub fn event_reminder_plain_text(ticket: &TicketDetails) -> String {
    let age = age_minutes(&ticket.created);
    format!(
        "UP {} мин.   {}   {}\nTicket {}\n{}\n{}",
        age, ticket.customer_id, ticket.r#type, ticket.ticket_number, ticket.title, ticket.url
    )
}

/// `floor((now - parse(created, "YYYY-MM-DD HH:MM:SS MSK")) / 60)`, or
/// `"UNKNOWN"` if `created` does not parse. The TS supplies naive
/// timestamps labeled MSK; they are treated as UTC+3 with no DST handling,
/// matching how the source system always has.
fn age_minutes(created: &str) -> String {
    match parse_ticket_created(created) {
        Some(created_at) => {
            let elapsed = Utc::now().signed_duration_since(created_at);
            let minutes = elapsed.num_seconds().max(0) / 60;
            minutes.to_string()
        }
        None => "UNKNOWN".to_string(),
    }
}

fn parse_ticket_created(created: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(created, "%Y-%m-%d %H:%M:%S").ok()?;
    let msk_offset = chrono::FixedOffset::east_opt(3 * 3600)?;
    let with_offset = msk_offset.from_local_datetime(&naive).single()?;
    Some(with_offset.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> TicketDetails {
        TicketDetails {
            ticket_number: "2024010100001".to_string(),
            r#type: "X".to_string(),
            customer_id: "ACME".to_string(),
            title: "disk".to_string(),
            lock: "unlock".to_string(),
            state_type: "open".to_string(),
            created: "2024-01-01 10:00:00".to_string(),
            url: "https://ts.example.com/ticket/4242".to_string(),
        }
    }

    #[test]
    fn new_layout_matches_literal_format() {
        let text = event_new_plain_text(&ticket());
        assert_eq!(
            text,
            "NEW ACME   X\nTicket 2024010100001\ndisk\nhttps://ts.example.com/ticket/4242"
        );
    }

    #[test]
    fn reminder_layout_contains_age_and_fields() {
        let text = event_reminder_plain_text(&ticket());
        assert!(text.starts_with("UP "));
        assert!(text.contains(" мин.   ACME   X\n"));
        assert!(text.contains("Ticket 2024010100001\ndisk\nhttps://ts.example.com/ticket/4242"));
    }

    #[test]
    fn unparseable_created_falls_back_to_unknown() {
        let mut t = ticket();
        t.created = "not-a-date".to_string();
        let text = event_reminder_plain_text(&t);
        assert!(text.starts_with("UP UNKNOWN мин."));
    }
}
