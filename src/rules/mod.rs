//! Security rule catalogue and evaluation engine
//!
//! Rules are static data: an id, a risk tier, the headers inspected, and a
//! pure predicate over one observed response. Evaluation applies the whole
//! catalogue in order and never short-circuits, so every response yields a
//! complete verdict set.

use crate::models::{ObservedResponse, RiskLevel, RuleVerdict, Verdict};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// A single static security check. `validate` must be total (it cannot
/// assume any header is present) and must not touch shared state.
pub struct SecurityRule {
    pub v_type: &'static str,
    pub name: &'static str,
    pub risk: RiskLevel,
    /// Header names the predicate inspects
    pub check_headers: &'static [&'static str],
    pub description: &'static str,
    /// `true` means the response passes (no issue)
    pub validate: fn(&ObservedResponse) -> bool,
}

/// The bundled catalogue, shared read-only across all evaluations
pub fn catalogue() -> &'static [SecurityRule] {
    CATALOGUE
}

/// Applies every catalogue rule to one response, in catalogue order.
///
/// A panicking predicate is isolated: the rule is recorded as
/// indeterminate and the remaining rules still run.
pub fn evaluate(response: &ObservedResponse) -> Vec<RuleVerdict> {
    evaluate_with(CATALOGUE, response)
}

pub fn evaluate_with(rules: &[SecurityRule], response: &ObservedResponse) -> Vec<RuleVerdict> {
    rules
        .iter()
        .map(|rule| {
            let verdict = match catch_unwind(AssertUnwindSafe(|| (rule.validate)(response))) {
                Ok(true) => Verdict::Pass,
                Ok(false) => Verdict::Fail,
                Err(_) => {
                    warn!(
                        "Rule '{}' predicate panicked evaluating {}",
                        rule.v_type, response.url
                    );
                    Verdict::Indeterminate
                }
            };
            RuleVerdict {
                v_type: rule.v_type,
                url: response.url.clone(),
                verdict,
            }
        })
        .collect()
}

fn has_hsts(response: &ObservedResponse) -> bool {
    response
        .header("strict-transport-security")
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn has_csp(response: &ObservedResponse) -> bool {
    response.header("content-security-policy").is_some()
}

/// Every received Set-Cookie value must carry the flag; no cookies at all
/// is a pass.
fn cookies_carry_flag(response: &ObservedResponse, flag: &str) -> bool {
    response
        .header_values("set-cookie")
        .iter()
        .all(|cookie| cookie.to_ascii_lowercase().contains(flag))
}

fn cookies_httponly(response: &ObservedResponse) -> bool {
    cookies_carry_flag(response, "httponly")
}

fn cookies_secure(response: &ObservedResponse) -> bool {
    cookies_carry_flag(response, "secure")
}

fn frame_options_ok(response: &ObservedResponse) -> bool {
    match response.header("x-frame-options") {
        Some(v) => {
            let upper = v.trim().to_ascii_uppercase();
            upper == "DENY" || upper == "SAMEORIGIN"
        }
        None => false,
    }
}

fn content_type_nosniff(response: &ObservedResponse) -> bool {
    response
        .header("x-content-type-options")
        .map(|v| v.trim().eq_ignore_ascii_case("nosniff"))
        .unwrap_or(false)
}

fn has_cache_control(response: &ObservedResponse) -> bool {
    response.header("cache-control").is_some()
}

fn has_referrer_policy(response: &ObservedResponse) -> bool {
    response.header("referrer-policy").is_some()
}

fn has_permissions_policy(response: &ObservedResponse) -> bool {
    response.header("permissions-policy").is_some()
}

static CATALOGUE: &[SecurityRule] = &[
    SecurityRule {
        v_type: "MISSING_HSTS",
        name: "Missing HTTP Strict Transport Security policy",
        risk: RiskLevel::High,
        check_headers: &["strict-transport-security"],
        description: "Without Strict-Transport-Security the browser may be \
            downgraded to plain HTTP, exposing traffic to SSL-stripping \
            man-in-the-middle attacks.",
        validate: has_hsts,
    },
    SecurityRule {
        v_type: "MISSING_CSP",
        name: "Missing Content-Security-Policy header",
        risk: RiskLevel::Medium,
        check_headers: &["content-security-policy"],
        description: "Content-Security-Policy restricts where scripts, \
            styles and other resources may load from, limiting the impact \
            of cross-site scripting.",
        validate: has_csp,
    },
    SecurityRule {
        v_type: "MISSING_HTTPONLY_COOKIE",
        name: "Cookie set without the HttpOnly flag",
        risk: RiskLevel::Medium,
        check_headers: &["set-cookie"],
        description: "Cookies without HttpOnly are readable from \
            document.cookie, so an injected script can exfiltrate session \
            identifiers.",
        validate: cookies_httponly,
    },
    SecurityRule {
        v_type: "MISSING_SECURE_COOKIE",
        name: "Cookie set without the Secure flag",
        risk: RiskLevel::Medium,
        check_headers: &["set-cookie"],
        description: "Cookies without Secure are also sent over unencrypted \
            HTTP connections where they can be captured in transit.",
        validate: cookies_secure,
    },
    SecurityRule {
        v_type: "MISSING_X_FRAME_OPTIONS",
        name: "Missing or weak X-Frame-Options header",
        risk: RiskLevel::Medium,
        check_headers: &["x-frame-options"],
        description: "X-Frame-Options must be DENY or SAMEORIGIN to stop \
            the page being framed by other origins for clickjacking.",
        validate: frame_options_ok,
    },
    SecurityRule {
        v_type: "MISSING_X_CONTENT_TYPE_OPTIONS",
        name: "Missing X-Content-Type-Options header",
        risk: RiskLevel::Low,
        check_headers: &["x-content-type-options"],
        description: "X-Content-Type-Options: nosniff stops browsers from \
            guessing MIME types, preventing content-type confusion.",
        validate: content_type_nosniff,
    },
    SecurityRule {
        v_type: "MISSING_CACHE_CONTROL",
        name: "Missing Cache-Control header",
        risk: RiskLevel::Low,
        check_headers: &["cache-control"],
        description: "Responses without Cache-Control may be stored by \
            intermediaries, leaking content that was meant to stay private.",
        validate: has_cache_control,
    },
    SecurityRule {
        v_type: "MISSING_REFERRER_POLICY",
        name: "Missing Referrer-Policy header",
        risk: RiskLevel::Low,
        check_headers: &["referrer-policy"],
        description: "Without Referrer-Policy the full page URL can leak to \
            third parties through the Referer header.",
        validate: has_referrer_policy,
    },
    SecurityRule {
        v_type: "MISSING_PERMISSIONS_POLICY",
        name: "Missing Permissions-Policy header",
        risk: RiskLevel::Low,
        check_headers: &["permissions-policy"],
        description: "Permissions-Policy restricts access to powerful \
            browser features such as camera, microphone and geolocation.",
        validate: has_permissions_policy,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_response() -> ObservedResponse {
        ObservedResponse::new("https://example.com/app", 200)
    }

    #[test]
    fn test_one_verdict_per_rule_in_catalogue_order() {
        let verdicts = evaluate(&bare_response());
        assert_eq!(verdicts.len(), catalogue().len());
        for (verdict, rule) in verdicts.iter().zip(catalogue()) {
            assert_eq!(verdict.v_type, rule.v_type);
        }
    }

    #[test]
    fn test_hsts_missing_fails_present_passes() {
        let verdicts = evaluate(&bare_response());
        let hsts = verdicts.iter().find(|v| v.v_type == "MISSING_HSTS").unwrap();
        assert_eq!(hsts.verdict, Verdict::Fail);

        let response =
            bare_response().with_header("Strict-Transport-Security", "max-age=31536000");
        let verdicts = evaluate(&response);
        let hsts = verdicts.iter().find(|v| v.v_type == "MISSING_HSTS").unwrap();
        assert_eq!(hsts.verdict, Verdict::Pass);
    }

    #[test]
    fn test_cookie_flags_checked_per_cookie() {
        let response = bare_response()
            .with_header("Set-Cookie", "sid=abc; HttpOnly; Secure")
            .with_header("Set-Cookie", "theme=dark");
        let verdicts = evaluate(&response);
        let httponly = verdicts
            .iter()
            .find(|v| v.v_type == "MISSING_HTTPONLY_COOKIE")
            .unwrap();
        assert_eq!(httponly.verdict, Verdict::Fail);

        // No cookies at all is a vacuous pass
        let verdicts = evaluate(&bare_response());
        let httponly = verdicts
            .iter()
            .find(|v| v.v_type == "MISSING_HTTPONLY_COOKIE")
            .unwrap();
        assert_eq!(httponly.verdict, Verdict::Pass);
    }

    #[test]
    fn test_nosniff_requires_exact_value() {
        let response = bare_response().with_header("X-Content-Type-Options", "NoSniff");
        let verdicts = evaluate(&response);
        let nosniff = verdicts
            .iter()
            .find(|v| v.v_type == "MISSING_X_CONTENT_TYPE_OPTIONS")
            .unwrap();
        assert_eq!(nosniff.verdict, Verdict::Pass);

        let response = bare_response().with_header("X-Content-Type-Options", "sniff");
        let verdicts = evaluate(&response);
        let nosniff = verdicts
            .iter()
            .find(|v| v.v_type == "MISSING_X_CONTENT_TYPE_OPTIONS")
            .unwrap();
        assert_eq!(nosniff.verdict, Verdict::Fail);
    }

    #[test]
    fn test_panicking_predicate_is_isolated() {
        fn explode(_: &ObservedResponse) -> bool {
            panic!("broken predicate")
        }
        static RULES: &[SecurityRule] = &[
            SecurityRule {
                v_type: "BROKEN",
                name: "broken",
                risk: RiskLevel::Low,
                check_headers: &[],
                description: "",
                validate: explode,
            },
            SecurityRule {
                v_type: "OK",
                name: "ok",
                risk: RiskLevel::Low,
                check_headers: &["cache-control"],
                description: "",
                validate: has_cache_control,
            },
        ];

        let response = bare_response().with_header("Cache-Control", "no-store");
        let verdicts = evaluate_with(RULES, &response);
        assert_eq!(verdicts[0].verdict, Verdict::Indeterminate);
        assert_eq!(verdicts[1].verdict, Verdict::Pass);
    }
}
