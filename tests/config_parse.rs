use report_render::{config::Config, converter::Strategy, policy::RenderPolicy};

#[test]
fn parse_example_config() {
    let raw = include_str!("../report-render.example.toml");
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    assert_eq!(cfg.subprocess.timeout_seconds, 60);
    assert_eq!(cfg.locator.binary_name, "wkhtmltopdf");
    assert!(cfg.locator.candidates.iter().any(|c| c == "bin/wkhtmltopdf"));
    assert_eq!(
        RenderPolicy::from_config(&cfg).eligible,
        vec![Strategy::Embedded, Strategy::Subprocess, Strategy::Browser]
    );
}

#[test]
fn missing_sections_take_defaults() {
    let cfg: Config = toml::from_str("[page]\npaper_size = \"Letter\"\nmargin_mm = 5.0\n")
        .expect("parse TOML");
    assert_eq!(cfg.page.paper_size, "Letter");
    assert_eq!(cfg.browser.timeout_seconds, 60);
    assert!(cfg.browser.no_sandbox);
    assert_eq!(cfg.document.name, "SageAlpha_CRH_Report");
}

#[test]
fn chain_order_in_config_does_not_change_priority() {
    let cfg: Config =
        toml::from_str("[chain]\nstrategies = [\"browser\", \"embedded\", \"browser\"]\n")
            .expect("parse TOML");
    let policy = RenderPolicy::from_config(&cfg);
    assert_eq!(policy.eligible, vec![Strategy::Embedded, Strategy::Browser]);
    assert!(!policy.allows(Strategy::Subprocess));
}

#[test]
fn partial_section_keeps_other_fields() {
    let cfg: Config = toml::from_str("[locator]\nbinary = \"~/bin/wkhtmltopdf\"\n").expect("parse TOML");
    assert_eq!(cfg.locator.binary, "~/bin/wkhtmltopdf");
    assert_eq!(cfg.locator.binary_name, "wkhtmltopdf");
    assert_eq!(cfg.locator.candidates.len(), 5);
}
