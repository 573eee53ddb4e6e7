//! Map phase: run the compiled query over every object of one shard's
//! cursor, accumulating measures into a nested hashmap.
//!
//! Per-object execution walks the event stream in timestamp order. A
//! property with a positive id keeps its last seen value for the rest of the
//! object (or session); transient properties reset on every event. Armed
//! `WITHIN` windows tick before the statement walk so a window can match on
//! events where its enclosing condition is false.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::event::PropertyId;
use ethogram_core::value::{DataType, Value};
use ethogram_db::{EventView, ShardCursor};

use crate::ast::BinaryOp;
use crate::compile::{
    CExpr, CStatement, CompiledQuery, DimPlan, FieldPlan, MeasurePlan, SelectionPlan, VarKind,
    VarRef, WithinPlan,
};
use crate::hashmap::{Hashmap, Slot, HIST_MAX_SLOT, HIST_MIN_SLOT};

/// Which map pass is running. Queries with histogram measures run twice:
/// a range pass that only records per-leaf extrema, then a fill pass that
/// buckets values using the merged ranges.
#[derive(Clone, Copy)]
pub enum Pass<'a> {
    Standard,
    HistogramRange,
    HistogramFill(&'a Hashmap),
}

pub struct Mapper<'a> {
    plan: &'a CompiledQuery,
    session_idle_micros: Option<i64>,
    pass: Pass<'a>,
}

#[derive(Clone, Copy, Default)]
struct WithinState {
    armed: bool,
    armed_at: u64,
}

struct ObjectState {
    vars: Vec<Value>,
    properties: HashMap<PropertyId, Value>,
    within: Vec<WithinState>,
    event_index: u64,
    last_ts_micros: Option<i64>,
    timestamp_secs: i64,
}

impl ObjectState {
    fn new(plan: &CompiledQuery) -> ObjectState {
        ObjectState {
            vars: plan.vars.iter().map(|v| Value::zero(v.data_type)).collect(),
            properties: HashMap::new(),
            within: vec![WithinState::default(); plan.within_count],
            event_index: 0,
            last_ts_micros: None,
            timestamp_secs: 0,
        }
    }

    /// A session gap behaves like the start of a new object: variables,
    /// sticky properties, and armed windows all reset. The event index keeps
    /// counting; with every window disarmed that is unobservable.
    fn reset_session(&mut self, plan: &CompiledQuery) {
        for (var, decl) in self.vars.iter_mut().zip(&plan.vars) {
            *var = Value::zero(decl.data_type);
        }
        self.properties.clear();
        self.within.fill(WithinState::default());
    }
}

impl<'a> Mapper<'a> {
    pub fn new(plan: &'a CompiledQuery, session_idle_secs: u64, pass: Pass<'a>) -> Mapper<'a> {
        Mapper {
            plan,
            session_idle_micros: if session_idle_secs > 0 {
                Some(session_idle_secs as i64 * 1_000_000)
            } else {
                None
            },
            pass,
        }
    }

    /// Map every object on the cursor into `result`. A decode failure skips
    /// the object; store failures and cancellation abort the shard.
    pub fn run(
        &self,
        cursor: &mut ShardCursor<'_>,
        result: &mut Hashmap,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        while cursor.next_object()? {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(EthogramError::Cancelled);
                }
            }
            let mut state = ObjectState::new(self.plan);
            loop {
                match cursor.next_event() {
                    Ok(true) => {
                        let Some(view) = cursor.event_view() else {
                            break;
                        };
                        self.process_event(&mut state, view, result)?;
                    }
                    Ok(false) => break,
                    Err(EthogramError::Codec(detail)) => {
                        let id = cursor
                            .current_object_id()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .unwrap_or_default();
                        tracing::warn!(object = %id, error = %detail, "skipping object with undecodable events");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn process_event(
        &self,
        state: &mut ObjectState,
        view: EventView<'_>,
        result: &mut Hashmap,
    ) -> Result<()> {
        let ts_micros = view.timestamp.timestamp_micros();
        if let (Some(idle), Some(last)) = (self.session_idle_micros, state.last_ts_micros) {
            if ts_micros - last > idle {
                state.reset_session(self.plan);
            }
        }
        state.last_ts_micros = Some(ts_micros);
        state.timestamp_secs = view.timestamp.timestamp();

        state.properties.retain(|id, _| *id > 0);
        for (id, value) in view.data {
            state.properties.insert(*id, value.clone());
        }

        self.tick_within(&self.plan.statements, state, result)?;
        self.exec_statements(&self.plan.statements, state, result)?;
        state.event_index += 1;
        Ok(())
    }

    /// Advance every armed window. A window past its last step disarms; a
    /// condition match inside the step range runs the body once and disarms.
    /// Windows nested in any body tick too, whatever their parents' state.
    fn tick_within(
        &self,
        statements: &[CStatement],
        state: &mut ObjectState,
        result: &mut Hashmap,
    ) -> Result<()> {
        for statement in statements {
            if let CStatement::When {
                condition,
                within,
                body,
            } = statement
            {
                if let Some(w) = within {
                    if state.within[w.slot].armed {
                        let steps = state.event_index - state.within[w.slot].armed_at;
                        if steps > w.to as u64 {
                            state.within[w.slot].armed = false;
                        } else if steps >= w.from.max(1) as u64
                            && self.eval(condition, state)?.as_bool()
                        {
                            state.within[w.slot].armed = false;
                            self.exec_statements(body, state, result)?;
                        }
                    }
                }
                self.tick_within(body, state, result)?;
            }
        }
        Ok(())
    }

    fn exec_statements(
        &self,
        statements: &[CStatement],
        state: &mut ObjectState,
        result: &mut Hashmap,
    ) -> Result<()> {
        for statement in statements {
            match statement {
                CStatement::Set {
                    var,
                    data_type,
                    expr,
                } => {
                    let value = self.eval(expr, state)?;
                    state.vars[*var] = if *data_type == DataType::Factor {
                        Value::Factor(value.as_u64_lossy())
                    } else {
                        value.cast(*data_type)
                    };
                }
                CStatement::When {
                    condition,
                    within: None,
                    body,
                } => {
                    if self.eval(condition, state)?.as_bool() {
                        self.exec_statements(body, state, result)?;
                    }
                }
                CStatement::When {
                    condition,
                    within: Some(w),
                    body,
                } => self.visit_within(w, condition, body, state, result)?,
                CStatement::Select(idx) => {
                    self.exec_selection(&self.plan.selections[*idx], state, result)?
                }
            }
        }
        Ok(())
    }

    /// Reaching an unarmed window arms it at the current event; an armed
    /// window is left alone. A `0..m` window may match the arming event
    /// itself (later steps are the tick's job).
    fn visit_within(
        &self,
        w: &WithinPlan,
        condition: &CExpr,
        body: &[CStatement],
        state: &mut ObjectState,
        result: &mut Hashmap,
    ) -> Result<()> {
        if state.within[w.slot].armed {
            return Ok(());
        }
        state.within[w.slot] = WithinState {
            armed: true,
            armed_at: state.event_index,
        };
        if w.from == 0 && self.eval(condition, state)?.as_bool() {
            state.within[w.slot].armed = false;
            self.exec_statements(body, state, result)?;
        }
        Ok(())
    }

    fn exec_selection(
        &self,
        selection: &SelectionPlan,
        state: &mut ObjectState,
        result: &mut Hashmap,
    ) -> Result<()> {
        let mut path: Vec<u64> = Vec::with_capacity(1 + selection.dimensions.len() * 2);
        if let Some(h) = selection.name_hash {
            path.push(h);
        }
        for dim in &selection.dimensions {
            path.push(dim.name_hash);
            path.push(self.dim_key(dim, state)?);
        }

        let mut node = &mut *result;
        for key in &path {
            node = node.submap(*key);
        }

        for field in &selection.fields {
            if let MeasurePlan::Histogram { expr, bins } = &field.measure {
                self.accumulate_histogram(field, expr, *bins, &path, state, node)?;
                continue;
            }
            // The range pass only gathers histogram extrema.
            if matches!(self.pass, Pass::HistogramRange) {
                continue;
            }
            match &field.measure {
                MeasurePlan::Count => node.add_int(field.name_hash, 1),
                MeasurePlan::Sum(expr) => {
                    let value = self.eval(expr, state)?;
                    if field.float {
                        node.add_float(field.name_hash, value.as_f64());
                    } else {
                        node.add_int(field.name_hash, value.as_i64());
                    }
                }
                MeasurePlan::Min(expr) => {
                    let value = self.eval(expr, state)?;
                    node.min_float(field.name_hash, value.as_f64());
                }
                MeasurePlan::Max(expr) => {
                    let value = self.eval(expr, state)?;
                    node.max_float(field.name_hash, value.as_f64());
                }
                MeasurePlan::Histogram { .. } => {}
            }
        }
        Ok(())
    }

    fn accumulate_histogram(
        &self,
        field: &FieldPlan,
        expr: &CExpr,
        bins: usize,
        path: &[u64],
        state: &mut ObjectState,
        node: &mut Hashmap,
    ) -> Result<()> {
        let value = self.eval(expr, state)?.as_f64();
        match self.pass {
            Pass::Standard => Err(EthogramError::Query(
                "histogram measure outside a histogram pass".into(),
            )),
            Pass::HistogramRange => {
                let leaf = node.submap(field.name_hash);
                leaf.min_float(HIST_MIN_SLOT, value);
                leaf.max_float(HIST_MAX_SLOT, value);
                Ok(())
            }
            Pass::HistogramFill(range) => {
                let mut leaf_path = path.to_vec();
                leaf_path.push(field.name_hash);
                // Leaves unseen by the range pass (data written between the
                // two snapshots) contribute nothing.
                let Some(range_leaf) = range.walk(&leaf_path) else {
                    return Ok(());
                };
                let (Some(Slot::Min(min)), Some(Slot::Max(max))) =
                    (range_leaf.get(HIST_MIN_SLOT), range_leaf.get(HIST_MAX_SLOT))
                else {
                    return Ok(());
                };
                let width = (max - min) / bins as f64;
                let slot = if width > 0.0 {
                    (((value - min) / width).floor() as i64).clamp(0, bins as i64 - 1) as u64
                } else {
                    0
                };
                let leaf = node.submap(field.name_hash);
                leaf.add_int(slot, 1);
                leaf.min_float(HIST_MIN_SLOT, min);
                leaf.max_float(HIST_MAX_SLOT, max);
                Ok(())
            }
        }
    }

    fn dim_key(&self, dim: &DimPlan, state: &ObjectState) -> Result<u64> {
        let value = self.read_var(&dim.var, state);
        match dim.data_type {
            DataType::Factor => Ok(value.as_u64_lossy()),
            DataType::Integer => Ok(value.as_i64() as u64),
            DataType::Boolean => Ok(value.as_bool() as u64),
            DataType::String | DataType::Float => Err(EthogramError::Query(format!(
                "unsupported dimension type for {}: {}",
                dim.name,
                dim.data_type.as_str()
            ))),
        }
    }

    fn read_var(&self, var: &VarRef, state: &ObjectState) -> Value {
        match var.kind {
            VarKind::Timestamp => Value::Int(state.timestamp_secs),
            VarKind::Declared(idx) => state.vars[idx].clone(),
            VarKind::Property(id) => state
                .properties
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Value::zero(var.data_type)),
        }
    }

    fn eval(&self, expr: &CExpr, state: &ObjectState) -> Result<Value> {
        match expr {
            CExpr::Const(value) => Ok(value.clone()),
            CExpr::Var(var) => Ok(self.read_var(var, state)),
            CExpr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, state)?;
                let rhs = self.eval(rhs, state)?;
                Ok(apply_binary(*op, lhs, rhs))
            }
        }
    }
}

fn is_float(value: &Value) -> bool {
    matches!(value, Value::Float(_))
}

fn value_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Factor(a), Value::Factor(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(_), _) | (_, Value::String(_)) => false,
        _ => lhs.as_f64() == rhs.as_f64(),
    }
}

fn value_cmp(lhs: &Value, rhs: &Value) -> std::cmp::Ordering {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => lhs
            .as_f64()
            .partial_cmp(&rhs.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
    }
}

/// Arithmetic promotes to float when either side is float; division by zero
/// yields the zero value instead of faulting the query.
fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Value {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            if is_float(&lhs) || is_float(&rhs) {
                let (a, b) = (lhs.as_f64(), rhs.as_f64());
                Value::Float(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    _ => {
                        if b == 0.0 {
                            0.0
                        } else {
                            a / b
                        }
                    }
                })
            } else {
                let (a, b) = (lhs.as_i64(), rhs.as_i64());
                Value::Int(match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    _ => {
                        if b == 0 {
                            0
                        } else {
                            a.wrapping_div(b)
                        }
                    }
                })
            }
        }
        BinaryOp::Eq => Value::Bool(value_eq(&lhs, &rhs)),
        BinaryOp::Ne => Value::Bool(!value_eq(&lhs, &rhs)),
        BinaryOp::Lt => Value::Bool(value_cmp(&lhs, &rhs).is_lt()),
        BinaryOp::Le => Value::Bool(value_cmp(&lhs, &rhs).is_le()),
        BinaryOp::Gt => Value::Bool(value_cmp(&lhs, &rhs).is_gt()),
        BinaryOp::Ge => Value::Bool(value_cmp(&lhs, &rhs).is_ge()),
        BinaryOp::And => Value::Bool(lhs.as_bool() && rhs.as_bool()),
        BinaryOp::Or => Value::Bool(lhs.as_bool() || rhs.as_bool()),
    }
}
