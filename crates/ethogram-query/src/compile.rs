//! Query compilation: resolve an AST against a table's catalog into an
//! executable plan.
//!
//! This step does everything the per-event loop must not: it registers
//! declared variables as transient properties, resolves every variable
//! reference to its slot, and interns string literals compared against
//! factor operands so the hot loop only ever sees sequences.

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::PropertyId;
use ethogram_core::hash::name_hash;
use ethogram_core::value::{DataType, Value};
use ethogram_db::{Factorizer, Table};

use crate::ast::{BinaryOp, Expr, Measure, Query, Selection, Statement};

/// Sequence that no stored factor value can carry; a literal missing from
/// the dictionary compiles to this so its comparisons are simply never true.
pub const UNKNOWN_FACTOR: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub enum VarKind {
    /// Index into the per-object declared-variable table.
    Declared(usize),
    /// Catalog property, read from the object's current property state.
    Property(PropertyId),
    /// Unix seconds of the current event.
    Timestamp,
}

#[derive(Debug, Clone)]
pub struct VarRef {
    pub kind: VarKind,
    pub data_type: DataType,
    /// For factor-typed references: the property whose dictionary holds the
    /// values (the declared association wins over the variable's own name).
    pub factor_property: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CExpr {
    Const(Value),
    Var(VarRef),
    Binary {
        op: BinaryOp,
        lhs: Box<CExpr>,
        rhs: Box<CExpr>,
    },
}

#[derive(Debug, Clone)]
pub struct VarPlan {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub struct DimPlan {
    pub name: String,
    pub name_hash: u64,
    pub data_type: DataType,
    pub var: VarRef,
    /// Dictionary property used to render factor keys in the reduce phase.
    pub factor_property: String,
}

#[derive(Debug, Clone)]
pub enum MeasurePlan {
    Count,
    Sum(CExpr),
    Min(CExpr),
    Max(CExpr),
    Histogram { expr: CExpr, bins: usize },
}

#[derive(Debug, Clone)]
pub struct FieldPlan {
    pub name: String,
    pub name_hash: u64,
    pub measure: MeasurePlan,
    /// Whether the measure is rendered (and accumulated) as a float.
    pub float: bool,
}

#[derive(Debug, Clone)]
pub struct SelectionPlan {
    pub name: String,
    pub name_hash: Option<u64>,
    pub dimensions: Vec<DimPlan>,
    pub fields: Vec<FieldPlan>,
}

#[derive(Debug, Clone)]
pub struct WithinPlan {
    pub from: u32,
    pub to: u32,
    /// Index into the per-object armed-window state table.
    pub slot: usize,
}

#[derive(Debug, Clone)]
pub enum CStatement {
    Set {
        var: usize,
        data_type: DataType,
        expr: CExpr,
    },
    When {
        condition: CExpr,
        within: Option<WithinPlan>,
        body: Vec<CStatement>,
    },
    /// Index into [`CompiledQuery::selections`].
    Select(usize),
}

/// Executable form of a query, shared by the map and reduce phases.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub statements: Vec<CStatement>,
    pub selections: Vec<SelectionPlan>,
    pub vars: Vec<VarPlan>,
    pub within_count: usize,
    pub has_histogram: bool,
}

pub fn compile(query: &Query, table: &Table, factorizer: &Factorizer) -> Result<CompiledQuery> {
    let mut compiler = Compiler {
        table,
        factorizer,
        vars: Vec::new(),
        associations: Vec::new(),
        selections: Vec::new(),
        within_count: 0,
        has_histogram: false,
    };
    compiler.collect_declares(&query.statements)?;
    let statements = compiler.compile_statements(&query.statements)?;
    Ok(CompiledQuery {
        statements,
        selections: compiler.selections,
        vars: compiler.vars,
        within_count: compiler.within_count,
        has_histogram: compiler.has_histogram,
    })
}

struct Compiler<'a> {
    table: &'a Table,
    factorizer: &'a Factorizer,
    vars: Vec<VarPlan>,
    associations: Vec<Option<String>>,
    selections: Vec<SelectionPlan>,
    within_count: usize,
    has_histogram: bool,
}

impl<'a> Compiler<'a> {
    /// Declarations may appear at any depth; hoist them all, registering
    /// each as a transient property of the table (ids are per-table, so
    /// repeated queries reuse the existing entry).
    fn collect_declares(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            match statement {
                Statement::Declare {
                    name,
                    data_type,
                    association,
                } => {
                    if self.vars.iter().any(|v| v.name == *name) {
                        return Err(EthogramError::Query(format!(
                            "variable declared twice: {name}"
                        )));
                    }
                    if self.table.property(name)?.is_none() {
                        self.table.create_property(name, *data_type, true)?;
                    }
                    self.vars.push(VarPlan {
                        name: name.clone(),
                        data_type: *data_type,
                    });
                    self.associations.push(association.clone());
                }
                Statement::When { body, .. } => self.collect_declares(body)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn resolve_var(&self, name: &str) -> Result<VarRef> {
        if let Some(idx) = self.vars.iter().position(|v| v.name == name) {
            let data_type = self.vars[idx].data_type;
            let factor_property = if data_type == DataType::Factor {
                Some(
                    self.associations[idx]
                        .clone()
                        .unwrap_or_else(|| name.to_string()),
                )
            } else {
                None
            };
            return Ok(VarRef {
                kind: VarKind::Declared(idx),
                data_type,
                factor_property,
            });
        }
        if let Some(property) = self.table.property(name)? {
            let factor_property = if property.data_type == DataType::Factor {
                Some(property.name.clone())
            } else {
                None
            };
            return Ok(VarRef {
                kind: VarKind::Property(property.id),
                data_type: property.data_type,
                factor_property,
            });
        }
        if name == "timestamp" {
            return Ok(VarRef {
                kind: VarKind::Timestamp,
                data_type: DataType::Integer,
                factor_property: None,
            });
        }
        Err(EthogramError::Query(format!("unknown variable: {name}")))
    }

    /// Intern a string literal against a factor operand's dictionary.
    fn factor_literal(&self, property: &str, literal: &str) -> Result<u64> {
        match self.factorizer.factorize(property, literal, false) {
            Ok(sequence) => Ok(sequence),
            Err(EthogramError::FactorNotFound { .. }) => Ok(UNKNOWN_FACTOR),
            Err(e) => Err(e),
        }
    }

    fn compile_expr(&self, expr: &Expr) -> Result<CExpr> {
        match expr {
            Expr::Int(v) => Ok(CExpr::Const(Value::Int(*v))),
            Expr::Float(v) => Ok(CExpr::Const(Value::Float(*v))),
            Expr::Str(v) => Ok(CExpr::Const(Value::String(v.clone()))),
            Expr::Bool(v) => Ok(CExpr::Const(Value::Bool(*v))),
            Expr::Var(name) => Ok(CExpr::Var(self.resolve_var(name)?)),
            Expr::Binary { op, lhs, rhs } => {
                let mut lhs = self.compile_expr(lhs)?;
                let mut rhs = self.compile_expr(rhs)?;
                if op.is_comparison() {
                    self.intern_factor_operand(&lhs, &mut rhs)?;
                    self.intern_factor_operand(&rhs, &mut lhs)?;
                }
                Ok(CExpr::Binary {
                    op: *op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
        }
    }

    /// If one comparison operand is a factor reference and the other a
    /// string literal, replace the literal with its sequence.
    fn intern_factor_operand(&self, reference: &CExpr, literal: &mut CExpr) -> Result<()> {
        let CExpr::Var(var) = reference else {
            return Ok(());
        };
        let Some(property) = &var.factor_property else {
            return Ok(());
        };
        if let CExpr::Const(Value::String(s)) = literal {
            let sequence = self.factor_literal(property, s)?;
            *literal = CExpr::Const(Value::Factor(sequence));
        }
        Ok(())
    }

    fn compile_statements(&mut self, statements: &[Statement]) -> Result<Vec<CStatement>> {
        let mut compiled = Vec::new();
        for statement in statements {
            match statement {
                Statement::Declare { .. } => {}
                Statement::Set { name, expr } => {
                    let Some(idx) = self.vars.iter().position(|v| v.name == *name) else {
                        return Err(EthogramError::Query(format!(
                            "cannot assign undeclared variable: {name}"
                        )));
                    };
                    let data_type = self.vars[idx].data_type;
                    let mut expr = self.compile_expr(expr)?;
                    if data_type == DataType::Factor {
                        if let (Some(property), CExpr::Const(Value::String(s))) =
                            (&self.associations[idx], &expr)
                        {
                            let sequence = self.factor_literal(property, s)?;
                            expr = CExpr::Const(Value::Factor(sequence));
                        } else if let CExpr::Const(Value::String(s)) = &expr {
                            let sequence = self.factor_literal(name, s)?;
                            expr = CExpr::Const(Value::Factor(sequence));
                        }
                    }
                    compiled.push(CStatement::Set {
                        var: idx,
                        data_type,
                        expr,
                    });
                }
                Statement::When {
                    condition,
                    within,
                    body,
                } => {
                    let condition = self.compile_expr(condition)?;
                    let within = match within {
                        Some((from, to)) => {
                            if from > to {
                                return Err(EthogramError::Query(format!(
                                    "invalid step window: {from}..{to}"
                                )));
                            }
                            let slot = self.within_count;
                            self.within_count += 1;
                            Some(WithinPlan {
                                from: *from,
                                to: *to,
                                slot,
                            })
                        }
                        None => None,
                    };
                    let body = self.compile_statements(body)?;
                    compiled.push(CStatement::When {
                        condition,
                        within,
                        body,
                    });
                }
                Statement::Select(selection) => {
                    let plan = self.compile_selection(selection)?;
                    self.selections.push(plan);
                    compiled.push(CStatement::Select(self.selections.len() - 1));
                }
            }
        }
        Ok(compiled)
    }

    fn compile_selection(&mut self, selection: &Selection) -> Result<SelectionPlan> {
        let mut dimensions = Vec::with_capacity(selection.dimensions.len());
        for name in &selection.dimensions {
            let var = self.resolve_var(name)?;
            match var.data_type {
                DataType::String => {
                    return Err(EthogramError::Query(format!(
                        "string dimensions are not supported: {name}"
                    )))
                }
                DataType::Float => {
                    return Err(EthogramError::Query(format!(
                        "float dimensions are not supported: {name}"
                    )))
                }
                _ => {}
            }
            let factor_property = var
                .factor_property
                .clone()
                .unwrap_or_else(|| name.clone());
            dimensions.push(DimPlan {
                name: name.clone(),
                name_hash: name_hash(name),
                data_type: var.data_type,
                var,
                factor_property,
            });
        }

        let mut fields = Vec::with_capacity(selection.fields.len());
        for field in &selection.fields {
            let (measure, float) = match &field.measure {
                Measure::Count => (MeasurePlan::Count, false),
                Measure::Sum(expr) => {
                    let expr = self.compile_expr(expr)?;
                    let float = expr_type(&expr) == DataType::Float;
                    (MeasurePlan::Sum(expr), float)
                }
                Measure::Min(expr) => {
                    let expr = self.compile_expr(expr)?;
                    let float = expr_type(&expr) == DataType::Float;
                    (MeasurePlan::Min(expr), float)
                }
                Measure::Max(expr) => {
                    let expr = self.compile_expr(expr)?;
                    let float = expr_type(&expr) == DataType::Float;
                    (MeasurePlan::Max(expr), float)
                }
                Measure::Histogram { expr, bins } => {
                    if *bins == 0 {
                        return Err(EthogramError::Query(format!(
                            "histogram needs at least one bin: {}",
                            field.name
                        )));
                    }
                    self.has_histogram = true;
                    let expr = self.compile_expr(expr)?;
                    let float = expr_type(&expr) == DataType::Float;
                    (
                        MeasurePlan::Histogram {
                            expr,
                            bins: *bins,
                        },
                        float,
                    )
                }
            };
            fields.push(FieldPlan {
                name: field.name.clone(),
                name_hash: name_hash(&field.name),
                measure,
                float,
            });
        }

        let name_hash = if selection.name.is_empty() {
            None
        } else {
            Some(name_hash(&selection.name))
        };
        Ok(SelectionPlan {
            name: selection.name.clone(),
            name_hash,
            dimensions,
            fields,
        })
    }
}

/// Static type of a compiled expression: arithmetic promotes to float when
/// either side is float, comparisons and logic are boolean.
pub fn expr_type(expr: &CExpr) -> DataType {
    match expr {
        CExpr::Const(Value::Int(_)) => DataType::Integer,
        CExpr::Const(Value::Float(_)) => DataType::Float,
        CExpr::Const(Value::String(_)) => DataType::String,
        CExpr::Const(Value::Bool(_)) => DataType::Boolean,
        CExpr::Const(Value::Factor(_)) => DataType::Factor,
        CExpr::Var(var) => var.data_type,
        CExpr::Binary { op, lhs, rhs } => match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                if expr_type(lhs) == DataType::Float || expr_type(rhs) == DataType::Float {
                    DataType::Float
                } else {
                    DataType::Integer
                }
            }
            _ => DataType::Boolean,
        },
    }
}
