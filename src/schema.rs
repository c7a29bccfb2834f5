use crate::error::{HarvestError, Result};
use crate::utils::{parse_period_string, periods_in_range};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// One calendar month of the retrieval range, written `MM/YYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|_| Self { year, month })
            .ok_or_else(|| HarvestError::InvalidPeriod(format!("{:02}/{:04}", month, year)))
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

impl FromStr for Period {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        parse_period_string(s)
    }
}

impl TryFrom<String> for Period {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self> {
        parse_period_string(&value)
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

impl JsonSchema for Period {
    fn schema_name() -> String {
        "Period".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// Stable key of a recurring line item: concept code, paying entity, description.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub concept_code: String,
    pub entity: String,
    pub description: String,
}

impl ItemDescriptor {
    pub fn new(
        concept_code: impl Into<String>,
        entity: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            concept_code: concept_code.into(),
            entity: entity.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for ItemDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}: {}",
            self.concept_code, self.entity, self.description
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Credits,
    Debits,
}

impl Category {
    pub fn sheet_name(self) -> &'static str {
        match self {
            Category::Credits => "Credits",
            Category::Debits => "Debits",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub descriptor: ItemDescriptor,
    pub amount: Decimal,
}

/// Line items of one category in the order the table listed them.
///
/// A descriptor appears at most once; a repeated row overwrites the amount
/// but keeps the position of its first appearance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItems {
    entries: Vec<LineItem>,
}

impl LineItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: ItemDescriptor, amount: Decimal) {
        match self.entries.iter_mut().find(|e| e.descriptor == descriptor) {
            Some(existing) => existing.amount = amount,
            None => self.entries.push(LineItem { descriptor, amount }),
        }
    }

    pub fn get(&self, descriptor: &ItemDescriptor) -> Option<Decimal> {
        self.entries
            .iter()
            .find(|e| &e.descriptor == descriptor)
            .map(|e| e.amount)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LineItem> {
        self.entries.iter()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ItemDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ItemDescriptor, Decimal)> for LineItems {
    fn from_iter<T: IntoIterator<Item = (ItemDescriptor, Decimal)>>(iter: T) -> Self {
        let mut items = LineItems::new();
        for (descriptor, amount) in iter {
            items.insert(descriptor, amount);
        }
        items
    }
}

/// Structured content of one period's receipt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodRecord {
    period: Period,
    credits: LineItems,
    debits: LineItems,
}

impl PeriodRecord {
    pub fn new(period: Period, credits: LineItems, debits: LineItems) -> Self {
        Self {
            period,
            credits,
            debits,
        }
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn credits(&self) -> &LineItems {
        &self.credits
    }

    pub fn debits(&self) -> &LineItems {
        &self.debits
    }

    pub fn items(&self, category: Category) -> &LineItems {
        match category {
            Category::Credits => &self.credits,
            Category::Debits => &self.debits,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.credits.is_empty() && self.debits.is_empty()
    }
}

#[derive(Clone, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    #[schemars(description = "Portal user name (CUIL), e.g. 27-12345678-9")]
    pub username: String,

    #[schemars(description = "Portal password")]
    pub password: String,

    #[schemars(description = "Benefit number whose receipts are retrieved")]
    pub beneficiary: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .field("beneficiary", &self.beneficiary)
            .finish()
    }
}

/// Bounds on every external wait, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Timeouts {
    #[schemars(description = "How long the operator has to solve the login challenge")]
    pub challenge_ms: u64,

    #[schemars(description = "Wait for a queried period's table to render")]
    pub render_ms: u64,

    #[schemars(description = "Wait for each navigation step (menus, query form, going back)")]
    pub navigation_ms: u64,

    #[schemars(description = "Wait for a period's PDF to appear and stop growing")]
    pub artifact_ms: u64,

    #[schemars(description = "Interval between download-folder polls")]
    pub poll_interval_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            challenge_ms: 30_000,
            render_ms: 10_000,
            navigation_ms: 10_000,
            artifact_ms: 20_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl Timeouts {
    pub fn challenge(&self) -> Duration {
        Duration::from_millis(self.challenge_ms)
    }

    pub fn render(&self) -> Duration {
        Duration::from_millis(self.render_ms)
    }

    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn artifact(&self) -> Duration {
        Duration::from_millis(self.artifact_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Where things live on the portal. Defaults target the benefits portal.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PortalProfile {
    pub login_url: String,
    pub username_field: String,
    pub password_field: String,
    pub submit_button: String,
    pub notice_close_button: String,
    #[schemars(description = "Visible text of the menu entry leading to the receipts service")]
    pub benefits_menu_text: String,
    pub receipts_link: String,
    pub beneficiary_select: String,
    pub month_input: String,
    pub year_input: String,
    pub consult_button: String,
    pub print_button: String,
    #[schemars(description = "CSS selector of the concepts table on a queried period")]
    pub concepts_table: String,
    #[schemars(description = "CSS selector of the data rows inside the concepts table")]
    pub concept_rows: String,
}

impl Default for PortalProfile {
    fn default() -> Self {
        Self {
            login_url: "https://servicioscorp.anses.gob.ar/clavelogon/logon.aspx?system=miansesv2"
                .to_string(),
            username_field: "#Usuario".to_string(),
            password_field: "#Clave".to_string(),
            submit_button: "#Ingresar".to_string(),
            notice_close_button: "button.btn-close[aria-label='Cerrar']".to_string(),
            benefits_menu_text: "Jubilaciones y pensiones".to_string(),
            receipts_link: "a[data-href*='10603']".to_string(),
            beneficiary_select: "#ctl00_PlaceContent_ddl_Beneficios".to_string(),
            month_input: "#ctl00_PlaceContent_txtMes".to_string(),
            year_input: "#ctl00_PlaceContent_txtAnio".to_string(),
            consult_button: "#ctl00_PlaceContent_btnConsultar".to_string(),
            print_button: "#ctl00_PlaceContent_btn_imprimir".to_string(),
            concepts_table: "#ctl00_PlaceContent_gvConceptos".to_string(),
            concept_rows: "tr.grilla_item, tr.grilla_aternateitem".to_string(),
        }
    }
}

/// Everything a run needs from the control surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunConfig {
    pub credentials: Credentials,

    #[schemars(description = "First period to retrieve, MM/YYYY")]
    pub start: Period,

    #[schemars(description = "Last period to retrieve (inclusive), MM/YYYY")]
    pub end: Period,

    #[schemars(description = "Root directory for run outputs and browser downloads")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub portal: PortalProfile,
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("username", &self.credentials.username),
            ("password", &self.credentials.password),
            ("beneficiary", &self.credentials.beneficiary),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(HarvestError::InvalidConfig(format!(
                    "credential field '{}' is empty",
                    name
                )));
            }
        }

        if self.end < self.start {
            return Err(HarvestError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }

        Ok(())
    }

    /// Folder the browser saves period documents into.
    pub fn download_dir(&self) -> PathBuf {
        self.output_dir.join("downloads")
    }

    /// The periods of the run, start to end inclusive.
    pub fn periods(&self) -> Result<Vec<Period>> {
        periods_in_range(self.start, self.end)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(RunConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RunConfig {
        RunConfig {
            credentials: Credentials {
                username: "27-12345678-9".to_string(),
                password: "secret".to_string(),
                beneficiary: "15584832490".to_string(),
            },
            start: Period::new(2024, 6).unwrap(),
            end: Period::new(2024, 11).unwrap(),
            output_dir: PathBuf::from("/tmp/receipts"),
            timeouts: Timeouts::default(),
            portal: PortalProfile::default(),
        }
    }

    #[test]
    fn test_period_ordering_and_display() {
        let dec = Period::new(2023, 12).unwrap();
        let jan = dec.next();
        assert_eq!(jan, Period::new(2024, 1).unwrap());
        assert!(dec < jan);
        assert_eq!(jan.to_string(), "01/2024");
        assert!(Period::new(2024, 0).is_err());
        assert!(Period::new(2024, 13).is_err());
    }

    #[test]
    fn test_line_items_keep_first_position() {
        let a = ItemDescriptor::new("001", "ANSES", "Haber mensual");
        let b = ItemDescriptor::new("002", "ANSES", "Bono");
        let mut items = LineItems::new();
        items.insert(a.clone(), Decimal::new(100, 0));
        items.insert(b.clone(), Decimal::new(20, 0));
        items.insert(a.clone(), Decimal::new(150, 0));

        let order: Vec<&ItemDescriptor> = items.descriptors().collect();
        assert_eq!(order, vec![&a, &b]);
        assert_eq!(items.get(&a), Some(Decimal::new(150, 0)));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_descriptor_display() {
        let d = ItemDescriptor::new("001", "ANSES", "Haber mensual");
        assert_eq!(d.to_string(), "001-ANSES: Haber mensual");
    }

    #[test]
    fn test_config_roundtrip_with_defaults() {
        let json = r#"{
            "credentials": {"username": "u", "password": "p", "beneficiary": "b"},
            "start": "06/2024",
            "end": "2024-11",
            "output_dir": "/tmp/out"
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.start, Period::new(2024, 6).unwrap());
        assert_eq!(config.end, Period::new(2024, 11).unwrap());
        assert_eq!(config.timeouts.artifact_ms, 20_000);
        assert_eq!(config.portal.submit_button, "#Ingresar");
        assert_eq!(config.periods().unwrap().len(), 6);

        let out = serde_json::to_string(&config).unwrap();
        assert!(out.contains("\"06/2024\""));
    }

    #[test]
    fn test_config_validation() {
        assert!(sample_config().validate().is_ok());

        let mut config = sample_config();
        config.credentials.password = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(HarvestError::InvalidConfig(_))
        ));

        let mut config = sample_config();
        config.end = Period::new(2024, 1).unwrap();
        assert!(matches!(
            config.validate(),
            Err(HarvestError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let config = sample_config();
        let debug = format!("{:?}", config.credentials);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("15584832490"));
    }

    #[test]
    fn test_schema_generation() {
        let schema_json = RunConfig::schema_as_json().unwrap();
        assert!(schema_json.contains("credentials"));
        assert!(schema_json.contains("output_dir"));
        assert!(schema_json.contains("challenge_ms"));
    }
}
