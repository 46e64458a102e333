//! Static per-type field tables.
//!
//! Every entity type is described once by a [`TypeDef`]: an ordered field
//! table whose positions are the [`FieldId`]s used in field tuples and
//! operations. Capabilities such as "versionable" or "has version roots"
//! are read off the table instead of being discovered at runtime.

use crate::error::{CoreError, CoreResult};
use dstate_protocol::{FieldId, FieldValue, TypeTag, VersionInfo};
use std::collections::{BTreeMap, BTreeSet};

/// What happens to a referencing entity when its target is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalPolicy {
    /// Reject the removal while the reference exists.
    Deny,
    /// Null the reference (or drop the collection entry).
    Clear,
    /// Remove the referencing entity as well.
    Cascade,
}

/// Kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain value.
    Scalar,
    /// Integer counter bumped on every accepted change.
    Version,
    /// Single reference to another entity.
    Reference {
        /// Type of the referenced entity.
        target: TypeTag,
        /// Policy applied when the target is removed.
        on_remove: RemovalPolicy,
    },
    /// Ordered set of references.
    Collection {
        /// Type of the items.
        item: TypeTag,
        /// Policy applied when an item is removed.
        on_remove: RemovalPolicy,
    },
}

impl FieldKind {
    /// Returns the associated type and removal policy of a reference or
    /// collection field.
    pub fn association(&self) -> Option<(TypeTag, RemovalPolicy)> {
        match *self {
            FieldKind::Reference { target, on_remove } => Some((target, on_remove)),
            FieldKind::Collection { item, on_remove } => Some((item, on_remove)),
            FieldKind::Scalar | FieldKind::Version => None,
        }
    }
}

/// One entry in a type's field table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Position in the field tuple.
    pub id: FieldId,
    /// Field name.
    pub name: String,
    /// Field kind.
    pub kind: FieldKind,
    /// Whether query fetches leave this field unavailable.
    pub lazy: bool,
}

impl FieldDef {
    /// Value a freshly created entity holds in this field.
    pub fn initial_value(&self) -> FieldValue {
        match self.kind {
            FieldKind::Version => FieldValue::Integer(0),
            FieldKind::Collection { .. } => FieldValue::Keys(Vec::new()),
            FieldKind::Scalar | FieldKind::Reference { .. } => FieldValue::Null,
        }
    }

    /// Checks that `value` can be assigned to this field with a plain set.
    ///
    /// # Errors
    ///
    /// Returns a schema error on a kind or target type mismatch.
    pub fn check_assignable(&self, value: &FieldValue) -> CoreResult<()> {
        match (&self.kind, value) {
            (FieldKind::Scalar, FieldValue::Ref(_) | FieldValue::Keys(_)) => Err(CoreError::schema(
                format!("scalar field {} cannot hold a reference", self.name),
            )),
            (FieldKind::Scalar, _) => Ok(()),
            (FieldKind::Version, FieldValue::Integer(_)) => Ok(()),
            (FieldKind::Version, _) => Err(CoreError::schema(format!(
                "version field {} holds integers only",
                self.name
            ))),
            (FieldKind::Reference { .. }, FieldValue::Null) => Ok(()),
            (FieldKind::Reference { target, .. }, FieldValue::Ref(key))
                if key.type_tag() == *target =>
            {
                Ok(())
            }
            (FieldKind::Reference { target, .. }, _) => Err(CoreError::schema(format!(
                "reference field {} expects null or a {target} key",
                self.name
            ))),
            (FieldKind::Collection { .. }, _) => Err(CoreError::schema(format!(
                "collection field {} is changed through collection operations",
                self.name
            ))),
        }
    }
}

/// Field table of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    tag: TypeTag,
    name: String,
    fields: Vec<FieldDef>,
    version_field: Option<FieldId>,
    version_roots: Vec<FieldId>,
}

impl TypeDef {
    /// Starts building a type definition.
    pub fn builder(tag: TypeTag, name: impl Into<String>) -> TypeDefBuilder {
        TypeDefBuilder {
            tag,
            name: name.into(),
            fields: Vec::new(),
            version_roots: Vec::new(),
        }
    }

    /// Returns the type tag.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Returns the type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the field table.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Returns a field by id.
    pub fn field(&self, id: FieldId) -> Option<&FieldDef> {
        self.fields.get(id.index())
    }

    /// Looks up a field id by name.
    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.id)
    }

    /// Returns the version counter field, if the type has one.
    pub fn version_field(&self) -> Option<FieldId> {
        self.version_field
    }

    /// Returns the reference fields naming version roots.
    pub fn version_roots(&self) -> &[FieldId] {
        &self.version_roots
    }

    /// Returns true if entities of this type carry a version stamp.
    pub fn is_versionable(&self) -> bool {
        self.version_field.is_some()
    }

    /// Returns true if changes propagate to version roots.
    pub fn has_version_roots(&self) -> bool {
        !self.version_roots.is_empty()
    }

    /// Field tuple of a freshly created entity.
    pub fn initial_values(&self) -> Vec<FieldValue> {
        self.fields.iter().map(FieldDef::initial_value).collect()
    }

    /// Computes the version stamp from a field lookup.
    pub fn version_info<'a>(&self, field: impl Fn(FieldId) -> Option<&'a FieldValue>) -> VersionInfo {
        let pairs = self
            .version_field
            .map(|id| (id, field(id).cloned().unwrap_or_default()))
            .into_iter()
            .collect();
        VersionInfo::from_pairs(pairs)
    }
}

/// Builder for [`TypeDef`].
#[derive(Debug)]
pub struct TypeDefBuilder {
    tag: TypeTag,
    name: String,
    fields: Vec<FieldDef>,
    version_roots: Vec<String>,
}

impl TypeDefBuilder {
    fn push(mut self, name: &str, kind: FieldKind, lazy: bool) -> Self {
        let id = FieldId::new(u16::try_from(self.fields.len()).unwrap_or(u16::MAX));
        self.fields.push(FieldDef {
            id,
            name: name.to_string(),
            kind,
            lazy,
        });
        self
    }

    /// Adds a scalar field.
    #[must_use]
    pub fn scalar(self, name: &str) -> Self {
        self.push(name, FieldKind::Scalar, false)
    }

    /// Adds a scalar field that query fetches leave unavailable.
    #[must_use]
    pub fn lazy_scalar(self, name: &str) -> Self {
        self.push(name, FieldKind::Scalar, true)
    }

    /// Adds a reference field.
    #[must_use]
    pub fn reference(self, name: &str, target: TypeTag, on_remove: RemovalPolicy) -> Self {
        self.push(name, FieldKind::Reference { target, on_remove }, false)
    }

    /// Adds a collection field.
    #[must_use]
    pub fn collection(self, name: &str, item: TypeTag, on_remove: RemovalPolicy) -> Self {
        self.push(name, FieldKind::Collection { item, on_remove }, false)
    }

    /// Adds the version counter field.
    #[must_use]
    pub fn version_field(self, name: &str) -> Self {
        self.push(name, FieldKind::Version, false)
    }

    /// Names a reference field whose target is a version root.
    #[must_use]
    pub fn version_root(mut self, field: &str) -> Self {
        self.version_roots.push(field.to_string());
        self
    }

    /// Validates and builds the type definition.
    ///
    /// # Errors
    ///
    /// Fails on duplicate field names, more than one version field, too
    /// many fields, or a version root that is not a reference field.
    pub fn build(self) -> CoreResult<TypeDef> {
        if self.fields.len() > usize::from(u16::MAX) {
            return Err(CoreError::schema(format!("type {} has too many fields", self.name)));
        }
        let mut names = BTreeSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(CoreError::schema(format!(
                    "type {} declares field {} twice",
                    self.name, field.name
                )));
            }
        }

        let mut version_fields = self
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Version)
            .map(|f| f.id);
        let version_field = version_fields.next();
        if version_fields.next().is_some() {
            return Err(CoreError::schema(format!(
                "type {} declares more than one version field",
                self.name
            )));
        }

        let mut version_roots = Vec::with_capacity(self.version_roots.len());
        for root in &self.version_roots {
            let field = self
                .fields
                .iter()
                .find(|f| &f.name == root)
                .ok_or_else(|| {
                    CoreError::schema(format!("type {} has no field {root}", self.name))
                })?;
            if !matches!(field.kind, FieldKind::Reference { .. }) {
                return Err(CoreError::schema(format!(
                    "version root {root} of type {} is not a reference field",
                    self.name
                )));
            }
            version_roots.push(field.id);
        }

        Ok(TypeDef {
            tag: self.tag,
            name: self.name,
            fields: self.fields,
            version_field,
            version_roots,
        })
    }
}

/// The set of entity types known to a disconnected state and its stores.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: BTreeMap<TypeTag, TypeDef>,
}

impl Schema {
    /// Builds a schema from type definitions.
    ///
    /// # Errors
    ///
    /// Fails on duplicate tags or associations naming an unknown type.
    pub fn new(types: impl IntoIterator<Item = TypeDef>) -> CoreResult<Self> {
        let mut map = BTreeMap::new();
        for def in types {
            let tag = def.tag;
            if map.insert(tag, def).is_some() {
                return Err(CoreError::schema(format!("type tag {tag} declared twice")));
            }
        }
        for def in map.values() {
            for field in &def.fields {
                if let Some((target, _)) = field.kind.association() {
                    if !map.contains_key(&target) {
                        return Err(CoreError::schema(format!(
                            "field {}.{} targets unknown type {target}",
                            def.name, field.name
                        )));
                    }
                }
            }
        }
        Ok(Self { types: map })
    }

    /// Returns a type definition.
    pub fn get(&self, tag: TypeTag) -> Option<&TypeDef> {
        self.types.get(&tag)
    }

    /// Returns a type definition or a schema error.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown.
    pub fn type_def(&self, tag: TypeTag) -> CoreResult<&TypeDef> {
        self.types
            .get(&tag)
            .ok_or_else(|| CoreError::schema(format!("unknown type {tag}")))
    }

    /// Returns a field definition or a schema error.
    ///
    /// # Errors
    ///
    /// Fails if the type or field is unknown.
    pub fn field(&self, tag: TypeTag, field: FieldId) -> CoreResult<&FieldDef> {
        let def = self.type_def(tag)?;
        def.field(field)
            .ok_or_else(|| CoreError::schema(format!("type {} has no field {field}", def.name)))
    }

    /// Iterates type definitions in tag order.
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Returns every (type, field) pair whose association targets `target`.
    pub fn associations_to(&self, target: TypeTag) -> Vec<(&TypeDef, &FieldDef)> {
        self.types
            .values()
            .flat_map(|def| def.fields.iter().map(move |field| (def, field)))
            .filter(|(_, field)| matches!(field.kind.association(), Some((t, _)) if t == target))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstate_protocol::Key;

    const PARENT: TypeTag = TypeTag::new(1);
    const CHILD: TypeTag = TypeTag::new(2);

    fn schema() -> Schema {
        let parent = TypeDef::builder(PARENT, "Parent")
            .scalar("Name")
            .version_field("Version")
            .collection("Children", CHILD, RemovalPolicy::Clear)
            .build()
            .unwrap();
        let child = TypeDef::builder(CHILD, "Child")
            .reference("Parent", PARENT, RemovalPolicy::Cascade)
            .lazy_scalar("Blob")
            .version_field("Version")
            .version_root("Parent")
            .build()
            .unwrap();
        Schema::new([parent, child]).unwrap()
    }

    #[test]
    fn field_ids_follow_declaration_order() {
        let schema = schema();
        let child = schema.type_def(CHILD).unwrap();
        assert_eq!(child.field_id("Parent"), Some(FieldId::new(0)));
        assert_eq!(child.field_id("Version"), Some(FieldId::new(2)));
        assert_eq!(child.version_field(), Some(FieldId::new(2)));
        assert_eq!(child.version_roots(), &[FieldId::new(0)]);
        assert!(child.field(FieldId::new(1)).unwrap().lazy);
        assert!(child.is_versionable() && child.has_version_roots());
    }

    #[test]
    fn initial_values_by_kind() {
        let schema = schema();
        let parent = schema.type_def(PARENT).unwrap();
        assert_eq!(
            parent.initial_values(),
            vec![
                FieldValue::Null,
                FieldValue::Integer(0),
                FieldValue::Keys(Vec::new())
            ]
        );
    }

    #[test]
    fn version_info_reads_version_field() {
        let schema = schema();
        let parent = schema.type_def(PARENT).unwrap();
        let values = vec![FieldValue::from("p"), FieldValue::Integer(4), FieldValue::Keys(vec![])];
        assert_eq!(
            parent.version_info(|id| values.get(id.index())),
            VersionInfo::from_pairs(vec![(FieldId::new(1), FieldValue::Integer(4))])
        );
    }

    #[test]
    fn associations_to_finds_references_and_collections() {
        let schema = schema();
        let to_child: Vec<_> = schema
            .associations_to(CHILD)
            .into_iter()
            .map(|(def, field)| (def.tag(), field.id))
            .collect();
        assert_eq!(to_child, vec![(PARENT, FieldId::new(2))]);
        assert_eq!(schema.associations_to(PARENT).len(), 1);
    }

    #[test]
    fn assignability() {
        let schema = schema();
        let child = schema.type_def(CHILD).unwrap();
        let parent_ref = child.field(FieldId::new(0)).unwrap();
        assert!(parent_ref.check_assignable(&FieldValue::Null).is_ok());
        assert!(parent_ref
            .check_assignable(&FieldValue::Ref(Key::from_id(PARENT, 1)))
            .is_ok());
        assert!(parent_ref
            .check_assignable(&FieldValue::Ref(Key::from_id(CHILD, 1)))
            .is_err());
        let blob = child.field(FieldId::new(1)).unwrap();
        assert!(blob.check_assignable(&FieldValue::Bytes(vec![1])).is_ok());
        assert!(blob
            .check_assignable(&FieldValue::Ref(Key::from_id(PARENT, 1)))
            .is_err());
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        assert!(TypeDef::builder(PARENT, "P")
            .scalar("A")
            .scalar("A")
            .build()
            .is_err());
        assert!(TypeDef::builder(PARENT, "P")
            .version_field("V1")
            .version_field("V2")
            .build()
            .is_err());
        assert!(TypeDef::builder(PARENT, "P")
            .scalar("A")
            .version_root("A")
            .build()
            .is_err());

        let dangling = TypeDef::builder(PARENT, "P")
            .reference("Other", TypeTag::new(99), RemovalPolicy::Deny)
            .build()
            .unwrap();
        assert!(Schema::new([dangling]).is_err());
    }
}
