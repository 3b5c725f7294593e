//! Table and column resolution, one scope per SELECT.
//!
//! Names bind innermost-first, the way DuckDB binds them: a SELECT sees the
//! relations of its own FROM clause, then those of the queries around it.
//! A CTE name is visible only inside the query whose WITH clause defines it,
//! and a projection alias only inside its own SELECT.
//!
//! An unqualified name passes when an allowlisted column or a column produced
//! by a CTE or derived table answers it before any column-restricted table
//! could. Once no restricted table is reachable, every name passes: the only
//! data left in reach is data the caller may read.
//!
//! Under [`WildcardMode::Expand`] a `*` over a column-restricted table is
//! rewritten into that table's allowed columns.

use crate::error::ErrorKind;
use crate::policy::{SecurityPolicy, WildcardMode};
use crate::validator::Rejection;
use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, Ident, JoinConstraint, JoinOperator, ObjectName,
    OrderByExpr, Query, Select, SelectItem, SetExpr, Statement, Table, TableFactor,
    TableWithJoins, VisitMut, VisitorMut, WildcardAdditionalOptions,
};
use sqlparser::keywords::ALL_KEYWORDS;
use std::collections::HashMap;
use std::ops::ControlFlow;

/// Check every relation and column `statement` references, expanding `*`
/// where the policy asks for it.
pub(crate) fn resolve(statement: &mut Statement, policy: &SecurityPolicy) -> Result<(), Rejection> {
    let query = match statement {
        Statement::Query(query) => query,
        Statement::Explain { statement, .. } => match statement.as_mut() {
            Statement::Query(query) => query,
            _ => return Err(not_a_query()),
        },
        _ => return Err(not_a_query()),
    };
    Resolver { policy }.query(query, None).map(drop)
}

/// Output columns of a query, CTE or derived table.
#[derive(Debug, Clone, Default)]
struct Columns {
    /// In output order; `None` where the engine picks the name.
    names: Vec<Option<String>>,
    /// Further columns whose names are not known here.
    open: bool,
}

impl Columns {
    fn open() -> Self {
        Self {
            names: Vec::new(),
            open: true,
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|known| known.as_deref() == Some(name))
    }

    /// Apply `AS t(a, b)` renames, which replace names by position.
    fn renamed(self, aliases: &[Ident]) -> Self {
        if aliases.is_empty() {
            return self;
        }
        let mut names: Vec<Option<String>> = aliases
            .iter()
            .map(|alias| Some(alias.value.to_lowercase()))
            .collect();
        // Positions are unknown past an open segment, so only the aliases are certain.
        if !self.open {
            names.extend(self.names.into_iter().skip(aliases.len()));
        }
        Self {
            names,
            open: self.open,
        }
    }

    fn extend(&mut self, other: &Columns) {
        self.names.extend(other.names.iter().cloned());
        self.open |= other.open;
    }
}

#[derive(Debug, Clone)]
enum Source {
    /// Allowlisted table, by lowercased full name.
    Table(String),
    /// CTE, derived table or UNNEST; its columns were checked where they
    /// were produced.
    Derived(Columns),
}

/// One entry of a FROM clause.
#[derive(Debug)]
struct Relation {
    /// Lowercased names a qualifier may use.
    names: Vec<String>,
    /// Qualifier as written, for expanding `*`.
    qualifier: Option<Vec<Ident>>,
    source: Source,
}

#[derive(Debug, Default)]
struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    ctes: HashMap<String, Columns>,
    relations: Vec<Relation>,
    aliases: Vec<String>,
}

impl<'a> Scope<'a> {
    fn child(parent: Option<&'a Scope<'a>>) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    /// This scope, then every enclosing one.
    fn chain(&self) -> impl Iterator<Item = &Scope<'a>> {
        std::iter::successors(Some(self), |scope| scope.parent)
    }

    fn cte(&self, name: &str) -> Option<&Columns> {
        self.chain().find_map(|level| level.ctes.get(name))
    }

    fn relation(&self, qualifier: &str) -> Option<&Relation> {
        self.chain().find_map(|level| {
            level
                .relations
                .iter()
                .find(|relation| relation.names.iter().any(|name| name == qualifier))
        })
    }
}

struct Resolver<'p> {
    policy: &'p SecurityPolicy,
}

impl Resolver<'_> {
    fn query(&self, query: &mut Query, parent: Option<&Scope<'_>>) -> Result<Columns, Rejection> {
        if !query.locks.is_empty() {
            return Err(shape("Row locking clauses are not allowed", "FOR UPDATE"));
        }

        let mut scope = Scope::child(parent);
        if let Some(with) = &mut query.with {
            let recursive = with.recursive;
            for cte in &mut with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                if recursive {
                    scope
                        .ctes
                        .insert(name.clone(), Columns::open().renamed(&cte.alias.columns));
                }
                let produced = self.query(&mut cte.query, Some(&scope))?;
                scope
                    .ctes
                    .insert(name, produced.renamed(&cte.alias.columns));
            }
        }

        let columns = self.set_expr(&mut query.body, &scope, Some(&mut query.order_by))?;

        self.collect(&mut query.limit, &scope)?;
        self.collect(&mut query.limit_by, &scope)?;
        self.collect(&mut query.offset, &scope)?;
        self.collect(&mut query.fetch, &scope)?;
        Ok(columns)
    }

    fn set_expr(
        &self,
        body: &mut SetExpr,
        scope: &Scope<'_>,
        order_by: Option<&mut Vec<OrderByExpr>>,
    ) -> Result<Columns, Rejection> {
        let columns = match body {
            SetExpr::Select(select) => return self.select(select, scope, order_by),
            SetExpr::Query(query) => self.query(query, Some(scope))?,
            // Output names come from the left branch.
            SetExpr::SetOperation { left, right, .. } => {
                let columns = self.set_expr(left, scope, None)?;
                self.set_expr(right, scope, None)?;
                columns
            }
            SetExpr::Values(values) => {
                self.collect(values, scope)?;
                Columns::open()
            }
            SetExpr::Table(table) => self.table_statement(table, scope)?,
            _ => {
                return Err(shape(
                    "Data-modifying statements are not allowed inside a query",
                    "DML",
                ))
            }
        };

        if let Some(order_by) = order_by {
            let mut output = Scope::child(Some(scope));
            output.relations.push(Relation {
                names: Vec::new(),
                qualifier: None,
                source: Source::Derived(columns.clone()),
            });
            for item in order_by {
                self.collect(&mut item.expr, &output)?;
            }
        }
        Ok(columns)
    }

    /// `TABLE name`, which reads every column.
    fn table_statement(&self, table: &Table, scope: &Scope<'_>) -> Result<Columns, Rejection> {
        let Some(name) = &table.table_name else {
            return Ok(Columns::open());
        };
        let full = match &table.schema_name {
            Some(schema) => format!("{}.{}", schema, name),
            None => name.clone(),
        }
        .to_lowercase();

        if table.schema_name.is_none() {
            if let Some(columns) = scope.cte(&full) {
                return Ok(columns.clone());
            }
        }
        let rule = self
            .policy
            .table(&full)
            .ok_or_else(|| table_rejection(&full))?;
        if !rule.allows_all_columns() {
            return Err(Rejection::new(
                ErrorKind::ColumnNotAllowed,
                format!(
                    "TABLE {} reads every column; select the allowed columns instead",
                    full
                ),
            )
            .with_token("*"));
        }
        Ok(Columns::open())
    }

    fn select(
        &self,
        select: &mut Select,
        parent: &Scope<'_>,
        order_by: Option<&mut Vec<OrderByExpr>>,
    ) -> Result<Columns, Rejection> {
        if select.into.is_some() {
            return Err(shape("SELECT ... INTO is not allowed", "INTO"));
        }
        if !select.lateral_views.is_empty() {
            return Err(
                Rejection::new(ErrorKind::TableNotAllowed, "LATERAL VIEW is not supported")
                    .with_token("LATERAL VIEW"),
            );
        }

        let mut scope = Scope::child(Some(parent));
        for table in &mut select.from {
            self.table_with_joins(table, &mut scope)?;
        }
        scope.aliases = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
                _ => None,
            })
            .collect();

        self.collect(&mut select.distinct, &scope)?;
        self.collect(&mut select.top, &scope)?;
        for item in &mut select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.collect(expr, &scope)?
                }
                SelectItem::Wildcard(options) | SelectItem::QualifiedWildcard(_, options) => {
                    self.collect(options, &scope)?
                }
            }
        }
        self.collect(&mut select.selection, &scope)?;
        self.collect(&mut select.group_by, &scope)?;
        self.collect(&mut select.having, &scope)?;
        self.collect(&mut select.qualify, &scope)?;
        self.collect(&mut select.named_window, &scope)?;
        for exprs in [
            &mut select.cluster_by,
            &mut select.distribute_by,
            &mut select.sort_by,
        ] {
            self.collect(exprs, &scope)?;
        }

        if let Some(order_by) = order_by {
            for item in order_by {
                // A bare output alias sorts by that output column.
                if let Expr::Identifier(ident) = &item.expr {
                    if scope.aliases.contains(&ident.value.to_lowercase()) {
                        continue;
                    }
                }
                self.collect(&mut item.expr, &scope)?;
            }
        }

        self.projection(&mut select.projection, &scope)
    }

    fn table_with_joins(
        &self,
        table: &mut TableWithJoins,
        scope: &mut Scope<'_>,
    ) -> Result<(), Rejection> {
        self.factor(&mut table.relation, scope)?;
        for join in &mut table.joins {
            self.factor(&mut join.relation, scope)?;
            match join_constraint(&mut join.join_operator) {
                Some(JoinConstraint::On(expr)) => self.collect(expr, scope)?,
                Some(JoinConstraint::Using(columns)) => self.using(columns, scope)?,
                Some(JoinConstraint::Natural) => {
                    if let Some(table) = scope
                        .relations
                        .iter()
                        .find_map(|relation| self.restricted(relation))
                    {
                        return Err(Rejection::new(
                            ErrorKind::ColumnNotAllowed,
                            format!("NATURAL JOIN is not allowed on table '{}'", table),
                        )
                        .with_token("NATURAL"));
                    }
                }
                Some(JoinConstraint::None) | None => {}
            }
        }
        Ok(())
    }

    /// `USING` compares the named column on every joined table.
    fn using(&self, columns: &[Ident], scope: &Scope<'_>) -> Result<(), Rejection> {
        for column in columns {
            let name = column.value.to_lowercase();
            for relation in &scope.relations {
                if let Some(table) = self.restricted(relation) {
                    let allowed = self
                        .policy
                        .table(table)
                        .map_or(false, |rule| rule.allows_column(&name));
                    if !allowed {
                        return Err(column_rejection(&column.value, Some(table)));
                    }
                }
            }
        }
        Ok(())
    }

    fn factor(&self, factor: &mut TableFactor, scope: &mut Scope<'_>) -> Result<(), Rejection> {
        let relation = match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                let full = object_name(name);
                if args.is_some() {
                    return Err(table_rejection(&full));
                }
                let cte = if name.0.len() == 1 {
                    scope.cte(&full).cloned()
                } else {
                    None
                };
                let source = match cte {
                    Some(columns) => Source::Derived(columns),
                    None if self.policy.table(&full).is_some() => Source::Table(full.clone()),
                    None => return Err(table_rejection(&full)),
                };
                match alias {
                    Some(alias) => Relation {
                        names: vec![alias.name.value.to_lowercase()],
                        qualifier: Some(vec![alias.name.clone()]),
                        source: self.renamed(source, &alias.columns)?,
                    },
                    None => {
                        let mut names = vec![full];
                        if let Some(last) = name.0.last() {
                            names.push(last.value.to_lowercase());
                        }
                        Relation {
                            names,
                            qualifier: Some(name.0.clone()),
                            source,
                        }
                    }
                }
            }
            // DuckDB binds sibling relations laterally, so the subquery sees
            // everything joined so far.
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let columns = self.query(subquery, Some(&*scope))?;
                match alias {
                    Some(alias) => Relation {
                        names: vec![alias.name.value.to_lowercase()],
                        qualifier: Some(vec![alias.name.clone()]),
                        source: Source::Derived(columns.renamed(&alias.columns)),
                    },
                    None => Relation {
                        names: Vec::new(),
                        qualifier: None,
                        source: Source::Derived(columns),
                    },
                }
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                if let Some(alias) = alias {
                    return Err(Rejection::new(
                        ErrorKind::TableNotAllowed,
                        format!("Aliased join '{}' is not supported", alias.name.value),
                    )
                    .with_token(alias.name.value.clone()));
                }
                return self.table_with_joins(table_with_joins, scope);
            }
            TableFactor::UNNEST {
                alias, array_exprs, ..
            } => {
                self.collect(array_exprs, scope)?;
                match alias {
                    Some(alias) => Relation {
                        names: vec![alias.name.value.to_lowercase()],
                        qualifier: Some(vec![alias.name.clone()]),
                        source: Source::Derived(Columns::open().renamed(&alias.columns)),
                    },
                    None => Relation {
                        names: Vec::new(),
                        qualifier: None,
                        source: Source::Derived(Columns::open()),
                    },
                }
            }
            other => {
                return Err(Rejection::new(
                    ErrorKind::TableNotAllowed,
                    format!("Relation '{}' is not allowed", other),
                )
                .with_token(other.to_string()))
            }
        };
        scope.relations.push(relation);
        Ok(())
    }

    /// `FROM t AS x(a, b)`: renaming a restricted table's columns by position
    /// would hide which real column each name reads.
    fn renamed(&self, source: Source, aliases: &[Ident]) -> Result<Source, Rejection> {
        if aliases.is_empty() {
            return Ok(source);
        }
        match source {
            Source::Derived(columns) => Ok(Source::Derived(columns.renamed(aliases))),
            Source::Table(table) => match self.policy.table(&table) {
                Some(rule) if rule.allows_all_columns() => {
                    Ok(Source::Derived(Columns::open().renamed(aliases)))
                }
                _ => Err(Rejection::new(
                    ErrorKind::ColumnNotAllowed,
                    format!("Column aliases are not allowed on table '{}'", table),
                )
                .with_token(aliases[0].value.clone())),
            },
        }
    }

    /// Rewrite or vet `*` projections and report the output columns.
    fn projection(
        &self,
        items: &mut Vec<SelectItem>,
        scope: &Scope<'_>,
    ) -> Result<Columns, Rejection> {
        let mut columns = Columns::default();
        let mut rewritten = Vec::with_capacity(items.len());

        for item in items.drain(..) {
            match &item {
                SelectItem::Wildcard(_) => {
                    let targets: Vec<&Relation> = scope.relations.iter().collect();
                    let qualify = targets.len() > 1;
                    self.wildcard(item, &targets, qualify, &mut rewritten, &mut columns)?;
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = object_name(name);
                    let relation = scope
                        .relations
                        .iter()
                        .find(|relation| relation.names.contains(&qualifier))
                        .ok_or_else(|| unresolved(format!("{}.*", qualifier)))?;
                    self.wildcard(item, &[relation], true, &mut rewritten, &mut columns)?;
                }
                SelectItem::UnnamedExpr(_) | SelectItem::ExprWithAlias { .. } => {
                    columns.names.push(output_name(&item));
                    rewritten.push(item);
                }
            }
        }

        *items = rewritten;
        Ok(columns)
    }

    fn wildcard(
        &self,
        item: SelectItem,
        targets: &[&Relation],
        qualify: bool,
        out: &mut Vec<SelectItem>,
        columns: &mut Columns,
    ) -> Result<(), Rejection> {
        let Some(table) = targets.iter().find_map(|relation| self.restricted(relation)) else {
            // Joined relations may merge USING columns, so positions are only
            // known for a single relation.
            match targets {
                [relation] => match &relation.source {
                    Source::Table(_) => columns.open = true,
                    Source::Derived(produced) => columns.extend(produced),
                },
                _ => columns.open = true,
            }
            out.push(item);
            return Ok(());
        };

        if self.policy.wildcard_mode() == WildcardMode::Reject {
            return Err(Rejection::new(
                ErrorKind::ColumnNotAllowed,
                format!(
                    "SELECT * is not allowed on table '{}'; list the allowed columns",
                    table
                ),
            )
            .with_token("*"));
        }
        if wildcard_options(&item).map_or(false, has_modifiers) {
            return Err(Rejection::new(
                ErrorKind::ColumnNotAllowed,
                format!(
                    "Wildcard modifiers are not allowed on table '{}'; list the allowed columns",
                    table
                ),
            )
            .with_token("*"));
        }

        for relation in targets {
            let prefix = if qualify {
                relation.qualifier.clone().ok_or_else(|| {
                    Rejection::new(
                        ErrorKind::ColumnNotAllowed,
                        "SELECT * over an unaliased subquery cannot be expanded; alias it or list the columns",
                    )
                    .with_token("*")
                })?
            } else {
                Vec::new()
            };

            let rule = match &relation.source {
                Source::Table(table) => self
                    .policy
                    .table(table)
                    .filter(|rule| !rule.allows_all_columns()),
                Source::Derived(_) => None,
            };
            match rule {
                Some(rule) => {
                    for column in rule.columns() {
                        let ident = column_ident(column);
                        let expr = if prefix.is_empty() {
                            Expr::Identifier(ident)
                        } else {
                            Expr::CompoundIdentifier(
                                prefix.iter().cloned().chain(std::iter::once(ident)).collect(),
                            )
                        };
                        columns.names.push(Some(column.to_lowercase()));
                        out.push(SelectItem::UnnamedExpr(expr));
                    }
                }
                None => {
                    match &relation.source {
                        Source::Table(_) => columns.open = true,
                        Source::Derived(produced) => columns.extend(produced),
                    }
                    out.push(if prefix.is_empty() {
                        SelectItem::Wildcard(WildcardAdditionalOptions::default())
                    } else {
                        SelectItem::QualifiedWildcard(
                            ObjectName(prefix),
                            WildcardAdditionalOptions::default(),
                        )
                    });
                }
            }
        }
        Ok(())
    }

    fn collect<T: VisitMut>(&self, node: &mut T, scope: &Scope<'_>) -> Result<(), Rejection> {
        let mut collector = Collector {
            resolver: self,
            scope,
            depth: 0,
        };
        match node.visit(&mut collector) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(rejection) => Err(rejection),
        }
    }

    fn column(&self, scope: &Scope<'_>, path: &[Ident]) -> Result<(), Rejection> {
        let Some((column, qualifier)) = path.split_last() else {
            return Ok(());
        };
        let name = column.value.to_lowercase();

        if qualifier.is_empty() {
            return if self.resolves(scope, &name) {
                Ok(())
            } else {
                Err(column_rejection(&column.value, None))
            };
        }

        let qualifier = dotted(qualifier);
        match scope.relation(&qualifier).map(|relation| &relation.source) {
            Some(Source::Table(table)) => {
                let allowed = self
                    .policy
                    .table(table)
                    .map_or(false, |rule| rule.allows_column(&name));
                if allowed {
                    Ok(())
                } else {
                    Err(column_rejection(&column.value, Some(table)))
                }
            }
            Some(Source::Derived(columns)) if columns.open || columns.contains(&name) => Ok(()),
            _ => Err(unresolved(format!("{}.{}", qualifier, name))),
        }
    }

    /// Whether an unqualified `name` binds to something the caller may read.
    fn resolves(&self, scope: &Scope<'_>, name: &str) -> bool {
        for level in scope.chain() {
            if self.guarded(level).is_none() {
                return true;
            }
            let mut restricted = false;
            for relation in &level.relations {
                match &relation.source {
                    Source::Table(table) => match self.policy.table(table) {
                        Some(rule) if rule.allows_all_columns() => {}
                        Some(rule) if rule.allows_column(name) => return true,
                        _ => restricted = true,
                    },
                    Source::Derived(columns) => {
                        if columns.contains(name) {
                            return true;
                        }
                    }
                }
            }
            // A restricted table at this level may hold `name` as a hidden column.
            if restricted {
                return false;
            }
        }
        true
    }

    /// `COLUMNS(...)` and star arguments expand to every column in scope.
    fn function(&self, function: &Function, scope: &Scope<'_>) -> Result<(), Rejection> {
        let name = object_name(&function.name);
        let star_argument = function.args.iter().any(|arg| {
            matches!(
                arg,
                FunctionArg::Named {
                    arg: FunctionArgExpr::Wildcard | FunctionArgExpr::QualifiedWildcard(_),
                    ..
                } | FunctionArg::Unnamed(
                    FunctionArgExpr::Wildcard | FunctionArgExpr::QualifiedWildcard(_)
                )
            )
        });
        let expands = name == "columns" || (star_argument && (name != "count" || function.distinct));
        if !expands {
            return Ok(());
        }
        match self.guarded(scope) {
            Some(table) => {
                let token = name.to_uppercase();
                Err(Rejection::new(
                    ErrorKind::ColumnNotAllowed,
                    format!(
                        "{}(...) reads every column and is not allowed on table '{}'",
                        token, table
                    ),
                )
                .with_token(token))
            }
            None => Ok(()),
        }
    }

    /// Table name of `relation` when its columns are restricted.
    fn restricted<'r>(&self, relation: &'r Relation) -> Option<&'r str> {
        match &relation.source {
            Source::Table(table) => match self.policy.table(table) {
                Some(rule) if rule.allows_all_columns() => None,
                _ => Some(table.as_str()),
            },
            Source::Derived(_) => None,
        }
    }

    /// First column-restricted table reachable from `scope`.
    fn guarded<'s>(&self, scope: &'s Scope<'_>) -> Option<&'s str> {
        scope
            .chain()
            .flat_map(|level| level.relations.iter())
            .find_map(|relation| self.restricted(relation))
    }
}

/// Walks one clause, resolving the names that belong to `scope` and handing
/// nested queries back to the resolver.
struct Collector<'r, 's, 'p> {
    resolver: &'r Resolver<'p>,
    scope: &'r Scope<'s>,
    /// Nesting inside subqueries the resolver already handled.
    depth: usize,
}

impl VisitorMut for Collector<'_, '_, '_> {
    type Break = Rejection;

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        let nested = carries_query(expr);
        if self.depth > 0 {
            self.depth += usize::from(nested);
            return ControlFlow::Continue(());
        }

        let result = match expr {
            Expr::Identifier(ident) => self
                .resolver
                .column(self.scope, std::slice::from_ref(ident)),
            Expr::CompoundIdentifier(parts) => self.resolver.column(self.scope, parts),
            Expr::Function(function) => self.resolver.function(function, self.scope),
            Expr::Subquery(query)
            | Expr::ArraySubquery(query)
            | Expr::Exists {
                subquery: query, ..
            } => self.resolver.query(query, Some(self.scope)).map(drop),
            Expr::InSubquery {
                expr: needle,
                subquery,
                ..
            } => self
                .resolver
                .collect(needle.as_mut(), self.scope)
                .and_then(|()| self.resolver.query(subquery, Some(self.scope)).map(drop)),
            _ => Ok(()),
        };
        self.depth += usize::from(nested);

        match result {
            Ok(()) => ControlFlow::Continue(()),
            Err(rejection) => ControlFlow::Break(rejection),
        }
    }

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if carries_query(expr) {
            self.depth = self.depth.saturating_sub(1);
        }
        ControlFlow::Continue(())
    }
}

fn carries_query(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Subquery(_) | Expr::ArraySubquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. }
    )
}

fn join_constraint(operator: &mut JoinOperator) -> Option<&mut JoinConstraint> {
    match operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint) => Some(constraint),
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

fn wildcard_options(item: &SelectItem) -> Option<&WildcardAdditionalOptions> {
    match item {
        SelectItem::Wildcard(options) | SelectItem::QualifiedWildcard(_, options) => Some(options),
        _ => None,
    }
}

fn has_modifiers(options: &WildcardAdditionalOptions) -> bool {
    options.opt_exclude.is_some()
        || options.opt_except.is_some()
        || options.opt_rename.is_some()
        || options.opt_replace.is_some()
}

fn output_name(item: &SelectItem) -> Option<String> {
    match item {
        SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.to_lowercase()),
        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
            parts.last().map(|part| part.value.to_lowercase())
        }
        _ => None,
    }
}

/// Identifier for a configured column, quoted unless it is a plain lowercase name.
fn column_ident(name: &str) -> Ident {
    let plain = name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ALL_KEYWORDS.contains(&name.to_ascii_uppercase().as_str());
    if plain {
        Ident::new(name)
    } else {
        Ident::with_quote('"', name)
    }
}

fn object_name(name: &ObjectName) -> String {
    dotted(&name.0)
}

fn dotted(parts: &[Ident]) -> String {
    parts
        .iter()
        .map(|part| part.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

fn not_a_query() -> Rejection {
    Rejection::new(
        ErrorKind::StatementNotAllowed,
        "Only query statements can be executed",
    )
}

fn shape(message: &str, token: &str) -> Rejection {
    Rejection::new(ErrorKind::StatementNotAllowed, message).with_token(token)
}

fn table_rejection(table: &str) -> Rejection {
    Rejection::new(
        ErrorKind::TableNotAllowed,
        format!("Table '{}' is not allowed", table),
    )
    .with_token(table.to_string())
}

fn unresolved(reference: String) -> Rejection {
    Rejection::new(
        ErrorKind::ColumnNotAllowed,
        format!("Cannot resolve column reference '{}'", reference),
    )
    .with_token(reference)
}

fn column_rejection(column: &str, table: Option<&str>) -> Rejection {
    let message = match table {
        Some(table) => format!("Column '{}' is not allowed on table '{}'", column, table),
        None => format!("Column '{}' is not allowed", column),
    };
    Rejection::new(ErrorKind::ColumnNotAllowed, message).with_token(column.to_string())
}
