//! Plan identifiers and the static limits catalog.
//!
//! Every capability gate in the platform resolves to a row in this catalog.
//! The catalog is pure data: no state, no I/O, and every plan identifier used
//! anywhere in the system has exactly one row here. Unknown identifiers read
//! from storage resolve to [`Plan::Free`] rather than erroring.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Subscription tier.
///
/// Ordering follows the explicit rank table: FREE < PRO < BUSINESS <
/// ENTERPRISE. Comparisons go through [`Plan::rank`] rather than string
/// comparison or declaration order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// Default tier for every new account.
    #[default]
    Free,
    /// Individual paid tier.
    Pro,
    /// Team tier; the lowest tier that members inherit from org owners.
    Business,
    /// Top tier, also granted by the operator whitelist.
    Enterprise,
}

impl Plan {
    /// Get the string representation of the plan.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
        }
    }

    /// Get the hierarchy rank (higher = more capability).
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Pro => 1,
            Self::Business => 2,
            Self::Enterprise => 3,
        }
    }

    /// Check whether this plan ranks at or above another.
    #[must_use]
    pub fn at_least(&self, other: Plan) -> bool {
        self.rank() >= other.rank()
    }

    /// Parse a stored plan identifier, resolving unknown values to FREE.
    ///
    /// Use this for values read back from the database, where an unknown or
    /// legacy identifier must degrade gracefully instead of erroring. For
    /// operator input use the strict [`FromStr`] impl.
    #[must_use]
    pub fn from_db(s: &str) -> Self {
        s.parse().unwrap_or(Self::Free)
    }

    /// All plans, in rank order.
    #[must_use]
    pub fn all() -> [Plan; 4] {
        [Self::Free, Self::Pro, Self::Business, Self::Enterprise]
    }
}

impl Ord for Plan {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Plan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing a plan string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePlanError {
    invalid_value: String,
}

impl fmt::Display for ParsePlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid plan: '{}' (expected: free, pro, business, or enterprise)",
            self.invalid_value
        )
    }
}

impl std::error::Error for ParsePlanError {}

impl FromStr for Plan {
    type Err = ParsePlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(ParsePlanError {
                invalid_value: s.to_string(),
            }),
        }
    }
}

/// Theme selection cap for a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeQuota {
    /// Up to this many themes.
    Limited(u32),
    /// No cap.
    Unlimited,
}

impl ThemeQuota {
    /// Check whether a theme count is allowed under this quota.
    #[must_use]
    pub fn allows(&self, count: u32) -> bool {
        match self {
            Self::Limited(max) => count <= *max,
            Self::Unlimited => true,
        }
    }
}

/// Fixed capability limits for a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub max_cards: u32,
    pub max_links: u32,
    pub analytics: bool,
    pub gallery: bool,
    pub bookings: bool,
    pub testimonials: bool,
    pub contacts: bool,
    pub services: bool,
    pub faq: bool,
    pub resume: bool,
    pub video: bool,
    pub custom_fonts: bool,
    pub custom_background: bool,
    /// Whether the platform watermark is shown on public cards.
    pub watermark: bool,
    pub leads_export: bool,
    pub org_dashboard: bool,
    pub branding: bool,
    pub custom_domain: bool,
    pub webhooks: bool,
    pub themes: ThemeQuota,
}

const FREE_LIMITS: PlanLimits = PlanLimits {
    max_cards: 1,
    max_links: 5,
    analytics: false,
    gallery: false,
    bookings: false,
    testimonials: false,
    contacts: false,
    services: false,
    faq: false,
    resume: false,
    video: false,
    custom_fonts: false,
    custom_background: false,
    watermark: true,
    leads_export: false,
    org_dashboard: false,
    branding: false,
    custom_domain: false,
    webhooks: false,
    themes: ThemeQuota::Limited(3),
};

const PRO_LIMITS: PlanLimits = PlanLimits {
    max_cards: 3,
    max_links: 50,
    analytics: true,
    gallery: true,
    bookings: true,
    testimonials: true,
    contacts: true,
    services: true,
    faq: true,
    resume: true,
    video: true,
    custom_fonts: true,
    custom_background: true,
    watermark: false,
    leads_export: false,
    org_dashboard: false,
    branding: false,
    custom_domain: false,
    webhooks: false,
    themes: ThemeQuota::Unlimited,
};

const BUSINESS_LIMITS: PlanLimits = PlanLimits {
    max_cards: 10,
    max_links: 200,
    analytics: true,
    gallery: true,
    bookings: true,
    testimonials: true,
    contacts: true,
    services: true,
    faq: true,
    resume: true,
    video: true,
    custom_fonts: true,
    custom_background: true,
    watermark: false,
    leads_export: true,
    org_dashboard: true,
    branding: true,
    custom_domain: false,
    webhooks: false,
    themes: ThemeQuota::Unlimited,
};

const ENTERPRISE_LIMITS: PlanLimits = PlanLimits {
    max_cards: 100,
    max_links: 1000,
    analytics: true,
    gallery: true,
    bookings: true,
    testimonials: true,
    contacts: true,
    services: true,
    faq: true,
    resume: true,
    video: true,
    custom_fonts: true,
    custom_background: true,
    watermark: false,
    leads_export: true,
    org_dashboard: true,
    branding: true,
    custom_domain: true,
    webhooks: true,
    themes: ThemeQuota::Unlimited,
};

/// Get the limits for a plan. Pure function of the plan alone.
#[must_use]
pub fn limits_for(plan: Plan) -> PlanLimits {
    match plan {
        Plan::Free => FREE_LIMITS,
        Plan::Pro => PRO_LIMITS,
        Plan::Business => BUSINESS_LIMITS,
        Plan::Enterprise => ENTERPRISE_LIMITS,
    }
}

/// A capability key in the limits catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Analytics,
    Gallery,
    Bookings,
    Testimonials,
    Contacts,
    Services,
    Faq,
    Resume,
    Video,
    CustomFonts,
    CustomBackground,
    Watermark,
    LeadsExport,
    OrgDashboard,
    Branding,
    CustomDomain,
    Webhooks,
    MaxCards,
    MaxLinks,
    Themes,
}

/// Check whether a plan includes a feature.
///
/// Lookups on non-boolean limit keys (`MaxCards`, `MaxLinks`, `Themes`)
/// always return true; callers compare the numeric value from
/// [`limits_for`] separately.
#[must_use]
pub fn has_feature(plan: Plan, feature: Feature) -> bool {
    let limits = limits_for(plan);
    match feature {
        Feature::Analytics => limits.analytics,
        Feature::Gallery => limits.gallery,
        Feature::Bookings => limits.bookings,
        Feature::Testimonials => limits.testimonials,
        Feature::Contacts => limits.contacts,
        Feature::Services => limits.services,
        Feature::Faq => limits.faq,
        Feature::Resume => limits.resume,
        Feature::Video => limits.video,
        Feature::CustomFonts => limits.custom_fonts,
        Feature::CustomBackground => limits.custom_background,
        Feature::Watermark => limits.watermark,
        Feature::LeadsExport => limits.leads_export,
        Feature::OrgDashboard => limits.org_dashboard,
        Feature::Branding => limits.branding,
        Feature::CustomDomain => limits.custom_domain,
        Feature::Webhooks => limits.webhooks,
        // Numeric keys: the gate is the value, not a flag.
        Feature::MaxCards | Feature::MaxLinks | Feature::Themes => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_ordering() {
        assert!(Plan::Free < Plan::Pro);
        assert!(Plan::Pro < Plan::Business);
        assert!(Plan::Business < Plan::Enterprise);
        assert!(Plan::Enterprise.at_least(Plan::Business));
        assert!(Plan::Business.at_least(Plan::Business));
        assert!(!Plan::Pro.at_least(Plan::Business));
    }

    #[test]
    fn test_parse_roundtrip() {
        for plan in Plan::all() {
            assert_eq!(plan.as_str().parse::<Plan>().unwrap(), plan);
        }
        assert_eq!("BUSINESS".parse::<Plan>().unwrap(), Plan::Business);
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn test_unknown_identifier_falls_back_to_free() {
        assert_eq!(Plan::from_db("gold"), Plan::Free);
        assert_eq!(Plan::from_db(""), Plan::Free);
        assert_eq!(limits_for(Plan::from_db("legacy-tier")), FREE_LIMITS);
    }

    #[test]
    fn test_limits_are_pure() {
        assert_eq!(limits_for(Plan::Pro), limits_for(Plan::Pro));
        assert_eq!(limits_for(Plan::Free), FREE_LIMITS);
    }

    #[test]
    fn test_tiers_are_supersets() {
        let plans = Plan::all();
        for pair in plans.windows(2) {
            let lower = limits_for(pair[0]);
            let higher = limits_for(pair[1]);
            assert!(higher.max_cards >= lower.max_cards);
            assert!(higher.max_links >= lower.max_links);
            // A higher tier never loses a boolean capability.
            assert!(!lower.analytics || higher.analytics);
            assert!(!lower.gallery || higher.gallery);
            assert!(!lower.leads_export || higher.leads_export);
            assert!(!lower.org_dashboard || higher.org_dashboard);
        }
    }

    #[test]
    fn test_feature_gates() {
        assert!(!has_feature(Plan::Free, Feature::Analytics));
        assert!(has_feature(Plan::Pro, Feature::Analytics));
        assert!(!has_feature(Plan::Pro, Feature::Branding));
        assert!(has_feature(Plan::Business, Feature::Branding));
        assert!(!has_feature(Plan::Business, Feature::CustomDomain));
        assert!(has_feature(Plan::Enterprise, Feature::CustomDomain));
        // Watermark is a flag like any other: true means shown.
        assert!(has_feature(Plan::Free, Feature::Watermark));
        assert!(!has_feature(Plan::Pro, Feature::Watermark));
    }

    #[test]
    fn test_numeric_keys_always_true() {
        for plan in Plan::all() {
            assert!(has_feature(plan, Feature::MaxCards));
            assert!(has_feature(plan, Feature::MaxLinks));
            assert!(has_feature(plan, Feature::Themes));
        }
    }

    #[test]
    fn test_theme_quota() {
        assert!(ThemeQuota::Limited(3).allows(3));
        assert!(!ThemeQuota::Limited(3).allows(4));
        assert!(ThemeQuota::Unlimited.allows(10_000));
    }
}
