//! The output shape a caller asks for, and its resolution against metadata.

use pgupsert_schema::{
    ColumnDescriptor, ComputedField, MetadataProvider, Relation, TableDescriptor,
};

use crate::error::{Error, ValidationError};

/// A selection of fields, possibly nested through relations.
///
/// # Example
///
/// ```
/// use pgupsert::Projection;
///
/// let projection = Projection::new()
///     .field("id")
///     .field("name")
///     .relation("posts", Projection::new().field("title"));
/// assert_eq!(projection.fields.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    pub fields: Vec<ProjectionField>,
}

/// One selected field.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionField {
    /// Column, computed field or relation name
    pub name: String,
    /// Output key, when different from `name`
    pub alias: Option<String>,
    /// Sub-selection; required for relations, forbidden otherwise
    pub selection: Option<Projection>,
}

impl ProjectionField {
    /// The key this field appears under in the output row.
    pub fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a column or computed field.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(ProjectionField {
            name: name.into(),
            alias: None,
            selection: None,
        });
        self
    }

    /// Select a column or computed field under another key.
    pub fn aliased(mut self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.fields.push(ProjectionField {
            name: name.into(),
            alias: Some(alias.into()),
            selection: None,
        });
        self
    }

    /// Select a relation with its own sub-selection.
    pub fn relation(mut self, name: impl Into<String>, selection: Projection) -> Self {
        self.fields.push(ProjectionField {
            name: name.into(),
            alias: None,
            selection: Some(selection),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A projection checked against table metadata.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedProjection<'t> {
    pub(crate) fields: Vec<ResolvedField<'t>>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedField<'t> {
    pub(crate) key: String,
    pub(crate) kind: FieldKind<'t>,
}

#[derive(Debug, Clone)]
pub(crate) enum FieldKind<'t> {
    Column(&'t ColumnDescriptor),
    Computed(&'t ComputedField),
    Relation {
        relation: &'t Relation,
        target: &'t TableDescriptor,
        projection: ResolvedProjection<'t>,
    },
}

impl<'t> ResolvedProjection<'t> {
    /// Resolve every field of `projection` on `table`, recursing into relations.
    ///
    /// An empty top-level projection is allowed: the rows are still written
    /// and come back as empty objects. A relation must select something.
    pub(crate) fn resolve<P: MetadataProvider + ?Sized>(
        provider: &'t P,
        table: &'t TableDescriptor,
        projection: &Projection,
    ) -> Result<Self, Error> {
        let mut fields: Vec<ResolvedField<'t>> = Vec::with_capacity(projection.fields.len());
        for field in &projection.fields {
            let key = field.key();
            if fields.iter().any(|f| f.key == key) {
                return Err(ValidationError::DuplicateField {
                    table: table.name.clone(),
                    key: key.to_string(),
                }
                .into());
            }

            let kind = resolve_field(provider, table, field)?;
            fields.push(ResolvedField {
                key: key.to_string(),
                kind,
            });
        }

        Ok(Self { fields })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn resolve_selection<P: MetadataProvider + ?Sized>(
        provider: &'t P,
        table: &'t TableDescriptor,
        projection: &Projection,
    ) -> Result<Self, Error> {
        if projection.is_empty() {
            return Err(ValidationError::EmptyProjection {
                table: table.name.clone(),
            }
            .into());
        }
        Self::resolve(provider, table, projection)
    }
}

fn resolve_field<'t, P: MetadataProvider + ?Sized>(
    provider: &'t P,
    table: &'t TableDescriptor,
    field: &ProjectionField,
) -> Result<FieldKind<'t>, Error> {
    let unexpected_selection = || ValidationError::UnexpectedSelection {
        table: table.name.clone(),
        field: field.name.clone(),
    };

    if let Some(column) = table.column_named(&field.name) {
        if field.selection.is_some() {
            return Err(unexpected_selection().into());
        }
        return Ok(FieldKind::Column(column));
    }

    if let Some(computed) = table.computed_named(&field.name) {
        if field.selection.is_some() {
            return Err(unexpected_selection().into());
        }
        return Ok(FieldKind::Computed(computed));
    }

    if let Some(relation) = table.relation_named(&field.name) {
        let Some(selection) = &field.selection else {
            return Err(ValidationError::MissingSelection {
                table: table.name.clone(),
                field: field.name.clone(),
            }
            .into());
        };
        let target = provider
            .table(&relation.target)
            .ok_or_else(|| Error::NotFound(relation.target.clone()))?;
        let projection = ResolvedProjection::resolve_selection(provider, target, selection)?;
        return Ok(FieldKind::Relation {
            relation,
            target,
            projection,
        });
    }

    Err(ValidationError::UnknownField {
        table: table.name.clone(),
        field: field.name.clone(),
    }
    .into())
}
