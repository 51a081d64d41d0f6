//! Allowlist policy properties
//!
//! Exercises the §8-style truth table: a principal is allowed iff
//! enforcement is disabled, or the email is in the exact set, or the email's
//! domain is in the domain set — including the deny-by-default empty-set
//! case.

use mcp_identity_gateway::config::IdentityConfig;
use mcp_identity_gateway::identity::Principal;
use mcp_identity_gateway::policy::AllowlistPolicy;
use pretty_assertions::assert_eq;

fn policy(enforce: bool, emails: &[&str], domains: &[&str]) -> AllowlistPolicy {
    AllowlistPolicy::from_config(&IdentityConfig {
        enforce,
        allowed_emails: emails.iter().map(ToString::to_string).collect(),
        allowed_email_domains: domains.iter().map(ToString::to_string).collect(),
    })
}

fn principal(email: &str) -> Principal {
    Principal {
        subject: "005xx01".to_string(),
        email: email.to_string(),
        display_name: None,
    }
}

#[test]
fn allowlist_truth_table() {
    struct Case {
        enforce: bool,
        emails: &'static [&'static str],
        domains: &'static [&'static str],
        candidate: &'static str,
        allowed: bool,
    }

    let cases = [
        // Enforcement off: everything goes
        Case { enforce: false, emails: &[], domains: &[], candidate: "eve@outsider.com", allowed: true },
        Case { enforce: false, emails: &["a@b.c"], domains: &[], candidate: "other@b.c", allowed: true },
        // Exact matches
        Case { enforce: true, emails: &["user1@company.com"], domains: &[], candidate: "user1@company.com", allowed: true },
        Case { enforce: true, emails: &["user1@company.com"], domains: &[], candidate: "user2@company.com", allowed: false },
        // Domain matches
        Case { enforce: true, emails: &[], domains: &["company.com"], candidate: "user2@company.com", allowed: true },
        Case { enforce: true, emails: &[], domains: &["company.com"], candidate: "eve@outsider.com", allowed: false },
        // Either rule set suffices
        Case { enforce: true, emails: &["guest@partner.io"], domains: &["company.com"], candidate: "guest@partner.io", allowed: true },
        Case { enforce: true, emails: &["guest@partner.io"], domains: &["company.com"], candidate: "staff@company.com", allowed: true },
        Case { enforce: true, emails: &["guest@partner.io"], domains: &["company.com"], candidate: "eve@partner.io", allowed: false },
        // Deny-by-default: enforcement with no rules allows nobody
        Case { enforce: true, emails: &[], domains: &[], candidate: "user1@company.com", allowed: false },
        Case { enforce: true, emails: &[], domains: &[], candidate: "admin@company.com", allowed: false },
    ];

    for case in &cases {
        let policy = policy(case.enforce, case.emails, case.domains);
        assert_eq!(
            policy.is_allowed(&principal(case.candidate)),
            case.allowed,
            "enforce={} emails={:?} domains={:?} candidate={}",
            case.enforce,
            case.emails,
            case.domains,
            case.candidate
        );
    }
}

#[test]
fn matching_ignores_case_on_both_sides() {
    let policy = policy(true, &["User1@Company.com"], &["Partner.IO"]);
    assert!(policy.is_allowed(&principal("USER1@COMPANY.COM")));
    assert!(policy.is_allowed(&principal("dev@partner.io")));
}

#[test]
fn domain_rule_does_not_match_exact_local_parts() {
    let policy = policy(true, &[], &["company.com"]);
    // The rule is a domain, not an email
    assert!(!policy.is_allowed(&principal("company.com")));
}
