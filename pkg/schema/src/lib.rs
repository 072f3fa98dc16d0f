use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::SerializeMap};
use thiserror::Error;

/// Maximum number of rows returned to a caller whose intent is display.
pub const DISPLAY_CAP: usize = 1000;

/// Sentinel language token meaning "no language constraint".
pub const LANGUAGE_WILDCARD: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),
}

// ---------------------------------------------------------------------------
// Datasets and shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dataset {
    MissingDateOfBirth,
    MissingDateOfDeath,
    MissingPlaceOfBirth,
    CatfactsMissingProperty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// One row per entity lacking a value, keyed by `qNumber`.
    MissingValue,
    /// One row per (entity, category, property) fact, keyed by `id`.
    CategoryFacts,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::MissingDateOfBirth,
        Dataset::MissingDateOfDeath,
        Dataset::MissingPlaceOfBirth,
        Dataset::CatfactsMissingProperty,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|dataset| dataset.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingDateOfBirth => "missingdateofbirth",
            Self::MissingDateOfDeath => "missingdateofdeath",
            Self::MissingPlaceOfBirth => "missingplaceofbirth",
            Self::CatfactsMissingProperty => "catfacts_missingproperty",
        }
    }

    pub fn shape(self) -> Shape {
        match self {
            Self::MissingDateOfBirth | Self::MissingDateOfDeath | Self::MissingPlaceOfBirth => {
                Shape::MissingValue
            }
            Self::CatfactsMissingProperty => Shape::CategoryFacts,
        }
    }

    pub fn layout(self) -> &'static ShapeLayout {
        self.shape().layout()
    }

    /// Physical tables backing one epoch. Both live in the schema named after the dataset.
    pub fn tables(self, epoch: &str) -> EpochTables {
        let base = format!("{}_{}", self.as_str(), epoch);
        EpochTables {
            log: TableRef::new(self.as_str(), format!("{base}_logging")),
            base: TableRef::new(self.as_str(), base),
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = SchemaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::from_name(raw).ok_or_else(|| SchemaError::UnknownDataset(raw.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Columns, fields and tables
// ---------------------------------------------------------------------------

/// Every column the two dataset shapes and their log tables use.
///
/// Declaration order is the order fields appear in serialized rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Id,
    QNumber,
    Entity,
    Category,
    Property,
    MissingValue,
    Refs,
    Languages,
    RefLanguages,
    User,
    Decision,
    ChangeTime,
}

impl Column {
    pub fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::QNumber => "qNumber",
            Self::Entity => "entity",
            Self::Category => "category",
            Self::Property => "property",
            Self::MissingValue => "missingValue",
            Self::Refs => "refs",
            Self::Languages => "languages",
            Self::RefLanguages => "refLanguages",
            Self::User => "user",
            Self::Decision => "decision",
            Self::ChangeTime => "changetime",
        }
    }
}

/// Which table of a base/log pair a field is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Base,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    pub side: Side,
    pub column: Column,
}

impl Field {
    pub const fn base(column: Column) -> Self {
        Self {
            side: Side::Base,
            column,
        }
    }

    pub const fn log(column: Column) -> Self {
        Self {
            side: Side::Log,
            column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochTables {
    pub base: TableRef,
    pub log: TableRef,
}

// ---------------------------------------------------------------------------
// Shape adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFilterStyle {
    /// `items`: any-of exact match against the natural key.
    ExactAny,
    /// `entitiesAnd` / `entitiesOr`: substring lists against the key column.
    SubstringLists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionFilterStyle {
    /// A single decision string compared by equality.
    Exact,
    /// A list of decisions, any of which may match.
    AnyOf,
}

/// Column mapping that lets one set of algorithms serve both dataset shapes.
#[derive(Debug, PartialEq, Eq)]
pub struct ShapeLayout {
    pub shape: Shape,
    /// Columns returned to callers in `all` and `unreviewed` modes.
    pub projection: &'static [Column],
    /// Every known base-table column, used when browsing a whole table.
    pub base_columns: &'static [Column],
    /// Columns shared by base and log table that an inner join matches on.
    pub join_keys: &'static [Column],
    /// Column whose values identify already-reviewed rows.
    pub review_key: Column,
    /// Column the key-list filter applies to.
    pub key_column: Column,
    pub language_column: Column,
    pub key_filter: KeyFilterStyle,
    pub decision_filter: DecisionFilterStyle,
}

const MISSING_VALUE_LAYOUT: ShapeLayout = ShapeLayout {
    shape: Shape::MissingValue,
    projection: &[Column::QNumber, Column::MissingValue, Column::Refs],
    base_columns: &[
        Column::QNumber,
        Column::MissingValue,
        Column::Refs,
        Column::Languages,
    ],
    join_keys: &[Column::QNumber],
    review_key: Column::QNumber,
    key_column: Column::QNumber,
    language_column: Column::Languages,
    key_filter: KeyFilterStyle::ExactAny,
    decision_filter: DecisionFilterStyle::Exact,
};

// The log table's `id` is the composite fact id, while callers see the
// denormalized `entity` column; both take part in the join.
const CATEGORY_FACTS_LAYOUT: ShapeLayout = ShapeLayout {
    shape: Shape::CategoryFacts,
    projection: &[
        Column::Entity,
        Column::Category,
        Column::Property,
        Column::MissingValue,
        Column::Refs,
    ],
    base_columns: &[
        Column::Id,
        Column::Entity,
        Column::Category,
        Column::Property,
        Column::MissingValue,
        Column::Refs,
        Column::RefLanguages,
    ],
    join_keys: &[
        Column::Id,
        Column::Entity,
        Column::Category,
        Column::Property,
    ],
    review_key: Column::Id,
    key_column: Column::Id,
    language_column: Column::RefLanguages,
    key_filter: KeyFilterStyle::SubstringLists,
    decision_filter: DecisionFilterStyle::AnyOf,
};

impl Shape {
    pub fn layout(self) -> &'static ShapeLayout {
        match self {
            Self::MissingValue => &MISSING_VALUE_LAYOUT,
            Self::CategoryFacts => &CATEGORY_FACTS_LAYOUT,
        }
    }
}

impl ShapeLayout {
    pub fn projection_fields(&self) -> Vec<Field> {
        self.projection.iter().copied().map(Field::base).collect()
    }

    /// Base projection followed by the reviewer and decision from the log table.
    pub fn reviewed_projection_fields(&self) -> Vec<Field> {
        let mut fields = self.projection_fields();
        fields.push(Field::log(Column::User));
        fields.push(Field::log(Column::Decision));
        fields
    }

    pub fn base_column_fields(&self) -> Vec<Field> {
        self.base_columns.iter().copied().map(Field::base).collect()
    }

    pub fn projects_review_key(&self) -> bool {
        self.projection.contains(&self.review_key)
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A record read from, or stored in, a dataset table. NULL cells are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Row {
    cells: BTreeMap<Column, String>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: Column, value: impl Into<String>) -> Self {
        self.cells.insert(column, value.into());
        self
    }

    pub fn insert(&mut self, column: Column, value: impl Into<String>) {
        self.cells.insert(column, value.into());
    }

    pub fn remove(&mut self, column: Column) -> Option<String> {
        self.cells.remove(&column)
    }

    pub fn get(&self, column: Column) -> Option<&str> {
        self.cells.get(&column).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn project(&self, columns: &[Column]) -> Row {
        let mut out = Row::new();
        for column in columns {
            if let Some(value) = self.cells.get(column) {
                out.cells.insert(*column, value.clone());
            }
        }
        out
    }

    pub fn missing_value(
        q_number: &str,
        missing_value: &str,
        refs: &str,
        languages: &str,
    ) -> Self {
        Row::new()
            .with(Column::QNumber, q_number)
            .with(Column::MissingValue, missing_value)
            .with(Column::Refs, refs)
            .with(Column::Languages, languages)
    }

    pub fn category_fact(
        id: &str,
        entity: &str,
        category: &str,
        property: &str,
        missing_value: &str,
        refs: &str,
        ref_languages: &str,
    ) -> Self {
        Row::new()
            .with(Column::Id, id)
            .with(Column::Entity, entity)
            .with(Column::Category, category)
            .with(Column::Property, property)
            .with(Column::MissingValue, missing_value)
            .with(Column::Refs, refs)
            .with(Column::RefLanguages, ref_languages)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column.name(), value)?;
        }
        map.end()
    }
}

/// One human review decision, as stored in a `<dataset>_<epoch>_logging` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewLogEntry {
    pub key: Row,
    pub user: String,
    pub decision: String,
    pub changetime: String,
}

impl ReviewLogEntry {
    pub fn missing_value(q_number: &str, user: &str, decision: &str, changetime: &str) -> Self {
        Self {
            key: Row::new().with(Column::QNumber, q_number),
            user: user.to_string(),
            decision: decision.to_string(),
            changetime: changetime.to_string(),
        }
    }

    pub fn category_fact(
        id: &str,
        entity: &str,
        category: &str,
        property: &str,
        user: &str,
        decision: &str,
        changetime: &str,
    ) -> Self {
        Self {
            key: Row::new()
                .with(Column::Id, id)
                .with(Column::Entity, entity)
                .with(Column::Category, category)
                .with(Column::Property, property),
            user: user.to_string(),
            decision: decision.to_string(),
            changetime: changetime.to_string(),
        }
    }

    pub fn into_row(self) -> Row {
        self.key
            .with(Column::User, self.user)
            .with(Column::Decision, self.decision)
            .with(Column::ChangeTime, self.changetime)
    }
}

// ---------------------------------------------------------------------------
// Filter request
// ---------------------------------------------------------------------------

/// `userDecision` arrives as a string for one shape and as a list for the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserDecision {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewMode {
    All,
    Reviewed,
    Unreviewed,
}

impl ReviewMode {
    /// A blank or absent mode means no restriction.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("all") => Self::All,
            Some("no") => Self::Unreviewed,
            Some(_) => Self::Reviewed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Reviewed => "reviewed",
            Self::Unreviewed => "unreviewed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// UI rendering: results are capped at [`DISPLAY_CAP`].
    Display,
    /// Export or counting: every matching row is returned.
    Export,
}

impl Intent {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("display") => Self::Display,
            _ => Self::Export,
        }
    }

    pub fn is_display(self) -> bool {
        self == Self::Display
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    #[serde(rename = "dsname", alias = "dataset", default)]
    pub dataset: String,
    #[serde(default, deserialize_with = "deserialize_epoch")]
    pub epoch: Option<String>,
    #[serde(default, alias = "entities")]
    pub items: Option<String>,
    #[serde(default)]
    pub entities_and: Option<String>,
    #[serde(default)]
    pub entities_or: Option<String>,
    #[serde(default)]
    pub languages_and: Option<Vec<String>>,
    #[serde(default)]
    pub languages_or: Option<Vec<String>>,
    #[serde(default)]
    pub reviewed: Option<String>,
    #[serde(default)]
    pub user_include: Option<String>,
    #[serde(default)]
    pub user_decision: Option<UserDecision>,
    #[serde(default, rename = "type")]
    pub intent: Option<String>,
}

impl FilterRequest {
    pub fn new(dataset: impl Into<String>, epoch: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            epoch: Some(epoch.into()),
            ..Self::default()
        }
    }

    pub fn review_mode(&self) -> ReviewMode {
        ReviewMode::parse(self.reviewed.as_deref())
    }

    pub fn intent(&self) -> Intent {
        Intent::parse(self.intent.as_deref())
    }
}

// Epochs are labels, but clients sometimes send them as JSON numbers.
fn deserialize_epoch<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EpochValue {
        Text(String),
        Number(i64),
    }

    Ok(
        Option::<EpochValue>::deserialize(deserializer)?.map(|value| match value {
            EpochValue::Text(text) => text,
            EpochValue::Number(number) => number.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_names_round_trip_and_map_to_shapes() {
        for dataset in Dataset::ALL {
            assert_eq!(Dataset::from_name(dataset.as_str()), Some(dataset));
        }
        assert_eq!(Dataset::MissingDateOfDeath.shape(), Shape::MissingValue);
        assert_eq!(
            Dataset::CatfactsMissingProperty.shape(),
            Shape::CategoryFacts
        );
        assert_eq!(
            "missingfoo".parse::<Dataset>(),
            Err(SchemaError::UnknownDataset("missingfoo".into()))
        );
    }

    #[test]
    fn epoch_tables_follow_naming_convention() {
        let tables = Dataset::MissingDateOfBirth.tables("20200101");
        assert_eq!(tables.base.schema, "missingdateofbirth");
        assert_eq!(tables.base.table, "missingdateofbirth_20200101");
        assert_eq!(tables.log.table, "missingdateofbirth_20200101_logging");
        assert_eq!(
            tables.log.to_string(),
            "missingdateofbirth.missingdateofbirth_20200101_logging"
        );
    }

    #[test]
    fn category_facts_join_on_composite_key_but_subtract_on_id() {
        let layout = Shape::CategoryFacts.layout();
        assert_eq!(
            layout.join_keys,
            &[Column::Id, Column::Entity, Column::Category, Column::Property]
        );
        assert_eq!(layout.review_key, Column::Id);
        assert!(!layout.projects_review_key());
        assert!(Shape::MissingValue.layout().projects_review_key());
    }

    #[test]
    fn reviewed_projection_appends_log_fields() {
        let fields = Shape::MissingValue.layout().reviewed_projection_fields();
        assert_eq!(
            fields,
            vec![
                Field::base(Column::QNumber),
                Field::base(Column::MissingValue),
                Field::base(Column::Refs),
                Field::log(Column::User),
                Field::log(Column::Decision),
            ]
        );
    }

    #[test]
    fn row_serializes_in_column_order() {
        let row = Row::new()
            .with(Column::Refs, "http://en.wikipedia.org/wiki/X")
            .with(Column::QNumber, "Q1");
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"qNumber":"Q1","refs":"http://en.wikipedia.org/wiki/X"}"#);
    }

    #[test]
    fn review_mode_and_intent_parse_like_the_wire_format() {
        assert_eq!(ReviewMode::parse(None), ReviewMode::All);
        assert_eq!(ReviewMode::parse(Some("all")), ReviewMode::All);
        assert_eq!(ReviewMode::parse(Some("")), ReviewMode::All);
        assert_eq!(ReviewMode::parse(Some("  ")), ReviewMode::All);
        assert_eq!(ReviewMode::parse(Some("no")), ReviewMode::Unreviewed);
        assert_eq!(ReviewMode::parse(Some("yes")), ReviewMode::Reviewed);
        assert!(Intent::parse(Some("display")).is_display());
        assert!(!Intent::parse(Some("download")).is_display());
        assert!(!Intent::parse(None).is_display());
    }

    #[test]
    fn filter_request_accepts_wire_field_names() {
        let req: FilterRequest = serde_json::from_str(
            r#"{
                "dsname": "catfacts_missingproperty",
                "epoch": 3,
                "entitiesOr": "Q1, Q2",
                "languagesAnd": ["en", "none"],
                "reviewed": "yes",
                "userDecision": ["accept", "reject"],
                "type": "display"
            }"#,
        )
        .unwrap();
        assert_eq!(req.dataset, "catfacts_missingproperty");
        assert_eq!(req.epoch.as_deref(), Some("3"));
        assert_eq!(req.entities_or.as_deref(), Some("Q1, Q2"));
        assert_eq!(
            req.languages_and,
            Some(vec!["en".to_string(), "none".to_string()])
        );
        assert_eq!(req.review_mode(), ReviewMode::Reviewed);
        assert_eq!(
            req.user_decision,
            Some(UserDecision::Many(vec!["accept".into(), "reject".into()]))
        );
        assert_eq!(req.intent(), Intent::Display);

        let legacy: FilterRequest =
            serde_json::from_str(r#"{"dataset":"missingdateofbirth","epoch":"7","entities":"Q9"}"#)
                .unwrap();
        assert_eq!(legacy.dataset, "missingdateofbirth");
        assert_eq!(legacy.items.as_deref(), Some("Q9"));
    }
}
