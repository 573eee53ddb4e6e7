//! Reduce phase: walk the compiled selection list over the merged hashmap
//! and render the nested result dictionary.
//!
//! Dimension keys are rendered by declared type: integers decimal, booleans
//! as `false`/`true` (key 0 is false), factors through the table's
//! dictionary using the association name when one was declared. String and
//! float dimensions are a hard error. A missing factor row aborts the whole
//! query.

use serde_json::{Map, Value as Json};

use ethogram_core::error::{EthogramError, Result};
use ethogram_core::value::DataType;
use ethogram_db::Factorizer;

use crate::compile::{CompiledQuery, FieldPlan, MeasurePlan, SelectionPlan};
use crate::hashmap::{Hashmap, Slot, HIST_MAX_SLOT, HIST_MIN_SLOT};

pub struct Reducer<'a> {
    plan: &'a CompiledQuery,
    factorizer: &'a Factorizer,
}

impl<'a> Reducer<'a> {
    pub fn new(plan: &'a CompiledQuery, factorizer: &'a Factorizer) -> Reducer<'a> {
        Reducer { plan, factorizer }
    }

    pub fn reduce(&self, data: &Hashmap) -> Result<Json> {
        let mut output = Map::new();
        for selection in &self.plan.selections {
            let node = match selection.name_hash {
                Some(h) => data.submap_ref(h),
                None => Some(data),
            };
            if selection.name.is_empty() {
                self.reduce_dimensions(node, selection, 0, &mut output)?;
            } else {
                let child = output
                    .entry(selection.name.clone())
                    .or_insert_with(|| Json::Object(Map::new()));
                let Some(child_map) = child.as_object_mut() else {
                    return Err(EthogramError::Query(format!(
                        "selection output collision: {}",
                        selection.name
                    )));
                };
                self.reduce_dimensions(node, selection, 0, child_map)?;
            }
        }
        Ok(Json::Object(output))
    }

    fn reduce_dimensions(
        &self,
        node: Option<&Hashmap>,
        selection: &SelectionPlan,
        depth: usize,
        out: &mut Map<String, Json>,
    ) -> Result<()> {
        if depth == selection.dimensions.len() {
            return self.reduce_fields(node, selection, out);
        }
        let dim = &selection.dimensions[depth];
        let Some(node) = node else {
            return Ok(());
        };
        let Some(dim_node) = node.submap_ref(dim.name_hash) else {
            return Ok(());
        };

        // Each dimension level renders as its name wrapping the value keys,
        // mirroring the name-hash child the mapper wrote into the hashmap.
        let named = out
            .entry(dim.name.clone())
            .or_insert_with(|| Json::Object(Map::new()));
        let Some(named_map) = named.as_object_mut() else {
            return Err(EthogramError::Query(format!(
                "dimension output collision: {}",
                dim.name
            )));
        };

        for key in dim_node.submap_keys() {
            let rendered = match dim.data_type {
                DataType::Integer => (key as i64).to_string(),
                DataType::Boolean => (key != 0).to_string(),
                DataType::Factor => {
                    self.factorizer
                        .defactorize(&dim.factor_property, key)
                        .map_err(|e| match e {
                            EthogramError::FactorNotFound { .. } => EthogramError::Query(format!(
                                "factor not found: {}/{}",
                                dim.factor_property, key
                            )),
                            other => other,
                        })?
                }
                DataType::String => {
                    return Err(EthogramError::Query(format!(
                        "string dimensions are not supported: {}",
                        dim.name
                    )))
                }
                DataType::Float => {
                    return Err(EthogramError::Query(format!(
                        "float dimensions are not supported: {}",
                        dim.name
                    )))
                }
            };

            let child = named_map
                .entry(rendered)
                .or_insert_with(|| Json::Object(Map::new()));
            let Some(child_map) = child.as_object_mut() else {
                return Err(EthogramError::Query(format!(
                    "dimension output collision: {}",
                    dim.name
                )));
            };
            self.reduce_dimensions(dim_node.submap_ref(key), selection, depth + 1, child_map)?;
        }
        Ok(())
    }

    fn reduce_fields(
        &self,
        node: Option<&Hashmap>,
        selection: &SelectionPlan,
        out: &mut Map<String, Json>,
    ) -> Result<()> {
        for field in &selection.fields {
            let value = match &field.measure {
                MeasurePlan::Count | MeasurePlan::Sum(_) => {
                    additive_json(node.and_then(|n| n.get(field.name_hash)), field.float)
                }
                MeasurePlan::Min(_) | MeasurePlan::Max(_) => {
                    extremum_json(node.and_then(|n| n.get(field.name_hash)), field.float)
                }
                MeasurePlan::Histogram { bins, .. } => {
                    histogram_json(node.and_then(|n| n.submap_ref(field.name_hash)), *bins, field)
                }
            };
            out.insert(field.name.clone(), value);
        }
        Ok(())
    }
}

fn additive_json(slot: Option<Slot>, float: bool) -> Json {
    match slot {
        Some(Slot::Int(v)) => Json::from(v),
        Some(Slot::Float(v)) => Json::from(v),
        _ => {
            if float {
                Json::from(0.0)
            } else {
                Json::from(0)
            }
        }
    }
}

fn extremum_json(slot: Option<Slot>, float: bool) -> Json {
    let value = match slot {
        Some(Slot::Min(v)) | Some(Slot::Max(v)) => v,
        _ => 0.0,
    };
    if float {
        Json::from(value)
    } else {
        Json::from(value as i64)
    }
}

fn histogram_json(leaf: Option<&Hashmap>, bins: usize, field: &FieldPlan) -> Json {
    let mut min = 0.0;
    let mut max = 0.0;
    let mut bin_map = Map::new();
    if let Some(leaf) = leaf {
        if let Some(Slot::Min(v)) = leaf.get(HIST_MIN_SLOT) {
            min = v;
        }
        if let Some(Slot::Max(v)) = leaf.get(HIST_MAX_SLOT) {
            max = v;
        }
        let mut slots: Vec<(u64, Slot)> = leaf
            .slots()
            .filter(|(key, _)| *key < bins as u64)
            .collect();
        slots.sort_unstable_by_key(|(key, _)| *key);
        for (key, slot) in slots {
            if let Slot::Int(count) = slot {
                bin_map.insert(key.to_string(), Json::from(count));
            }
        }
    }
    let width = (max - min) / bins as f64;

    let mut histogram = Map::new();
    histogram.insert("__histogram__".to_string(), Json::from(true));
    histogram.insert("bins".to_string(), Json::Object(bin_map));
    histogram.insert("count".to_string(), Json::from(bins));
    if field.float {
        histogram.insert("min".to_string(), Json::from(min));
        histogram.insert("max".to_string(), Json::from(max));
    } else {
        histogram.insert("min".to_string(), Json::from(min as i64));
        histogram.insert("max".to_string(), Json::from(max as i64));
    }
    histogram.insert("width".to_string(), Json::from(width));
    Json::Object(histogram)
}
