//! Identity resolution.
//!
//! Deterministic signal extraction, weighted scoring against the
//! customer/policy/claims directory, ranked candidates with margin
//! thresholds, and a request-for-information draft when the message cannot
//! be tied to an entity confidently.

pub mod signals;

mod resolver;

pub use resolver::{IdentityResolver, ResolverOutput};

/// Renders the request-information draft attached to NEEDS_REVIEW /
/// NO_CANDIDATE outcomes. Language-keyed, fixed templates.
pub fn render_request_info_draft(language: &str) -> String {
    match language {
        "de" => "Sehr geehrte Damen und Herren,\n\n\
                 vielen Dank für Ihre Nachricht. Um Ihr Anliegen zuordnen zu können, \
                 benötigen wir noch eine der folgenden Angaben:\n\n\
                 - Ihre Polizzennummer (Format: 12-3456789)\n\
                 - Ihre Schadennummer (Format: CLM-2024-0001)\n\
                 - Die beim Vertrag hinterlegte E-Mail-Adresse\n\n\
                 Bitte antworten Sie direkt auf diese E-Mail.\n"
            .to_string(),
        _ => "Dear Sir or Madam,\n\n\
              Thank you for your message. To match your request to a contract, \
              we still need one of the following:\n\n\
              - Your policy number (format: 12-3456789)\n\
              - Your claim number (format: CLM-2024-0001)\n\
              - The email address registered with the contract\n\n\
              Please reply directly to this email.\n"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn german_draft_mentions_policy_number_format() {
        let draft = render_request_info_draft("de");
        assert!(draft.contains("Polizzennummer"));
        assert!(draft.contains("12-3456789"));
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let draft = render_request_info_draft("fr");
        assert!(draft.contains("policy number"));
    }
}
