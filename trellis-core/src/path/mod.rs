//! Property Paths
//!
//! A path such as `lines.product{name, vendor<Supplier>.city}` names a set of
//! routes through the reference graph, starting at a root type. It compiles
//! once per `(root type, text)` into a tree of [`Step`]s that is cached on the
//! [`Schema`] and shared by every context.
//!
//! # Steps
//!
//! Each step observes one property. `next` holds the steps that continue from
//! the instances the property points to; `previous` leads back towards the
//! root. A step may carry:
//!
//! - an owner `filter`: only instances of that type (or derived) take part,
//!   set when the property is declared on a subtype of the current type or
//!   when the preceding step narrowed with `<Type>`;
//! - a value `target`: `<Type>` on the step itself, restricting which
//!   referenced instances are followed.
//!
//! # Notification
//!
//! When property `P` of instance `X` changes, every step observing `P` walks
//! backwards from `X` through in-references until it reaches root instances.
//! Each distinct `(path, root)` pair is marked dirty and delivered once, when
//! the outermost scope exits.

mod filter;
mod observe;
mod parser;

use std::fmt;

use smallvec::SmallVec;
use tracing::debug;

pub use filter::{FilterChange, FilterId};
pub(crate) use filter::FilterRegistry;
pub use observe::{PathChange, PathSubscription};
pub(crate) use observe::PathRegistry;

use crate::error::{GraphError, GraphResult};
use crate::model::{PropertyId, Schema, TypeId};
use parser::PathNode;

/// Identity of a compiled path within its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub(crate) u32);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

/// Position of a step in its path's step table.
pub type StepIndex = usize;

/// One property hop of a compiled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub(crate) property: PropertyId,
    pub(crate) filter: Option<TypeId>,
    pub(crate) target: Option<TypeId>,
    pub(crate) previous: Option<StepIndex>,
    pub(crate) next: SmallVec<[StepIndex; 2]>,
}

impl Step {
    pub fn property(&self) -> PropertyId {
        self.property
    }

    /// Owner type restriction.
    pub fn filter(&self) -> Option<TypeId> {
        self.filter
    }

    /// Value type restriction from `<Type>`.
    pub fn target(&self) -> Option<TypeId> {
        self.target
    }

    pub fn previous(&self) -> Option<StepIndex> {
        self.previous
    }

    pub fn next(&self) -> &[StepIndex] {
        &self.next
    }
}

/// A compiled path.
#[derive(Debug)]
pub struct PathDefinition {
    pub(crate) id: PathId,
    pub(crate) root: TypeId,
    pub(crate) text: String,
    pub(crate) steps: Vec<Step>,
    pub(crate) first: SmallVec<[StepIndex; 4]>,
}

impl PathDefinition {
    pub fn id(&self) -> PathId {
        self.id
    }

    pub fn root(&self) -> TypeId {
        self.root
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps that start at the root.
    pub fn first_steps(&self) -> &[StepIndex] {
        &self.first
    }
}

/// Compile `text` against `root`.
pub(crate) fn compile(schema: &Schema, root: TypeId, text: &str, id: PathId) -> GraphResult<PathDefinition> {
    let root_name = schema.graph_type(root).name();
    let fail = |reason: String| GraphError::invalid_path(root_name, text, reason);

    let nodes = parser::parse(text).map_err(fail)?;
    let mut compiler = Compiler {
        schema,
        steps: Vec::new(),
    };
    let mut first = SmallVec::new();
    for node in &nodes {
        compiler.node(node, root, None, None, &mut first).map_err(fail)?;
    }

    debug!(root = root_name, path = text, steps = compiler.steps.len(), "path compiled");
    Ok(PathDefinition {
        id,
        root,
        text: text.to_string(),
        steps: compiler.steps,
        first,
    })
}

struct Compiler<'s> {
    schema: &'s Schema,
    steps: Vec<Step>,
}

impl Compiler<'_> {
    /// Resolve `node` against `owner` and append its steps to `siblings`.
    fn node(
        &mut self,
        node: &PathNode,
        owner: TypeId,
        owner_filter: Option<TypeId>,
        previous: Option<StepIndex>,
        siblings: &mut SmallVec<[StepIndex; 4]>,
    ) -> Result<(), String> {
        let schema = self.schema;
        for (property, filter) in self.candidates(owner, owner_filter, &node.name)? {
            let declared = schema.property(property);
            if declared.is_value() && !node.children.is_empty() {
                return Err(format!("value property `{}` cannot have children", node.name));
            }
            let target = match &node.narrow {
                None => None,
                Some(narrow) => Some(self.narrowing(declared.target(), &node.name, narrow)?),
            };

            let index = match siblings.iter().copied().find(|&index| {
                let step = &self.steps[index];
                step.property == property && step.filter == filter && step.target == target
            }) {
                Some(index) => index,
                None => {
                    self.steps.push(Step {
                        property,
                        filter,
                        target,
                        previous,
                        next: SmallVec::new(),
                    });
                    let index = self.steps.len() - 1;
                    siblings.push(index);
                    index
                }
            };

            let Some(next_owner) = target.or(declared.target()) else {
                continue;
            };
            let mut next: SmallVec<[StepIndex; 4]> = self.steps[index].next.iter().copied().collect();
            for child in &node.children {
                self.node(child, next_owner, target, Some(index), &mut next)?;
            }
            self.steps[index].next = next.into_iter().collect();
        }
        Ok(())
    }

    /// The property `name` on `owner`, or on each subtype that declares it.
    fn candidates(
        &self,
        owner: TypeId,
        owner_filter: Option<TypeId>,
        name: &str,
    ) -> Result<Vec<(PropertyId, Option<TypeId>)>, String> {
        if let Some(property) = self.schema.graph_type(owner).property(name) {
            return Ok(vec![(property, owner_filter)]);
        }
        let found: Vec<_> = self
            .schema
            .descendants(owner)
            .into_iter()
            .filter_map(|subtype| {
                let property = self.schema.graph_type(subtype).property(name)?;
                (self.schema.property(property).declaring_type() == subtype).then_some((property, Some(subtype)))
            })
            .collect();
        if found.is_empty() {
            return Err(format!(
                "unknown property `{name}` on `{}`",
                self.schema.graph_type(owner).name()
            ));
        }
        Ok(found)
    }

    fn narrowing(&self, target: Option<TypeId>, name: &str, narrow: &str) -> Result<TypeId, String> {
        let Some(target) = target else {
            return Err(format!("value property `{name}` cannot be narrowed"));
        };
        let narrowed = self
            .schema
            .type_by_name(narrow)
            .ok_or_else(|| format!("unknown type `{narrow}`"))?
            .id();
        if !self.schema.is_a(narrowed, target) {
            return Err(format!(
                "`{narrow}` does not derive from `{}`",
                self.schema.graph_type(target).name()
            ));
        }
        Ok(narrowed)
    }
}
