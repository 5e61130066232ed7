//! Topological layout of a product's rules.
//!
//! Edges run from a consuming rule to every rule producing one of its
//! input, auxiliary-input or explicitly-depends-on tags, unless all of the
//! producer's outputs are excluded inputs of the consumer. Roots are the
//! rules producing the product's own type tags.

use crate::{
    error::{Error, ErrorKind, Result},
    language::{FileTag, FileTags, Rule},
};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Default)]
pub struct RuleGraph {
    rules: Vec<Arc<Rule>>,
    /// Per rule: indices of the rules feeding it.
    dependencies: Vec<Vec<usize>>,
    root_rules: Vec<usize>,
}

impl RuleGraph {
    pub fn build(rules: &[Arc<Rule>], product_file_tags: &FileTags) -> Self {
        let mut output_tag_to_rule: BTreeMap<FileTag, Vec<usize>> = BTreeMap::new();
        for (index, rule) in rules.iter().enumerate() {
            for tag in rule.collected_output_file_tags() {
                output_tag_to_rule.entry(tag).or_default().push(index);
            }
        }

        let mut dependencies = vec![Vec::new(); rules.len()];
        for (index, rule) in rules.iter().enumerate() {
            let mut in_tags = rule.inputs.clone();
            in_tags.extend(rule.auxiliary_inputs.iter().cloned());
            in_tags.extend(rule.explicitly_depends_on.iter().cloned());
            for tag in &in_tags {
                for &producer in output_tag_to_rule.get(tag).into_iter().flatten() {
                    if producer == index {
                        continue;
                    }
                    let producer_rule = &rules[producer];
                    let excluded = producer_rule
                        .collected_output_file_tags()
                        .iter()
                        .any(|t| rule.excluded_inputs.contains(t));
                    if !excluded && !dependencies[index].contains(&producer) {
                        dependencies[index].push(producer);
                    }
                }
            }
        }

        let mut root_rules = Vec::new();
        for tag in product_file_tags {
            for &index in output_tag_to_rule.get(tag).into_iter().flatten() {
                if !root_rules.contains(&index) {
                    root_rules.push(index);
                }
            }
        }

        Self { rules: rules.to_vec(), dependencies, root_rules }
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Depth-first traversal from the roots towards producing rules.
    ///
    /// `visit` receives `(consuming rule, rule)`; the consuming rule is
    /// `None` for roots. A cycle aborts the traversal with an error
    /// listing every rule on the cycle.
    pub fn traverse(
        &self,
        visit: &mut dyn FnMut(Option<&Arc<Rule>>, &Arc<Rule>),
    ) -> Result<()> {
        let mut on_stack = vec![false; self.rules.len()];
        let mut trail = Vec::new();
        for &root in &self.root_rules {
            self.traverse_from(None, root, &mut on_stack, &mut trail, visit)?;
        }
        Ok(())
    }

    fn traverse_from(
        &self,
        parent: Option<usize>,
        index: usize,
        on_stack: &mut Vec<bool>,
        trail: &mut Vec<usize>,
        visit: &mut dyn FnMut(Option<&Arc<Rule>>, &Arc<Rule>),
    ) -> Result<()> {
        if on_stack[index] {
            return Err(self.cycle_error(trail, index));
        }
        visit(parent.map(|p| &self.rules[p]), &self.rules[index]);
        on_stack[index] = true;
        trail.push(index);
        for &dep in &self.dependencies[index] {
            self.traverse_from(Some(index), dep, on_stack, trail, visit)?;
        }
        trail.pop();
        on_stack[index] = false;
        Ok(())
    }

    fn cycle_error(&self, trail: &[usize], repeated: usize) -> Error {
        let start = trail.iter().position(|&i| i == repeated).unwrap_or(0);
        let mut err = Error::new(ErrorKind::Cycle, "cycle detected in rule graph");
        for &index in &trail[start..] {
            let rule = &self.rules[index];
            err = err.append_located(format!("rule {rule}"), rule.location().clone());
        }
        let rule = &self.rules[repeated];
        err.append_located(format!("rule {rule}"), rule.location().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::CodeLocation, language::file_tags, language::ScriptSource};

    fn rule(name: &str, inputs: &[&str], outputs: &[&str]) -> Arc<Rule> {
        Arc::new(Rule {
            name: name.to_string(),
            inputs: file_tags(inputs.iter().copied()),
            output_file_tags: file_tags(outputs.iter().copied()),
            requires_inputs: true,
            prepare_script: ScriptSource::new("[]", CodeLocation::new("p.qry", 1, 1)),
            ..Default::default()
        })
    }

    #[test]
    fn layout_orders_producers_below_consumers() {
        let compiler = rule("compiler", &["c"], &["obj"]);
        let linker = rule("linker", &["obj"], &["application"]);
        let graph =
            RuleGraph::build(&[linker.clone(), compiler.clone()], &file_tags(["application"]));
        let mut order = Vec::new();
        graph
            .traverse(&mut |parent, rule| {
                order.push((parent.map(|p| p.name.clone()), rule.name.clone()));
            })
            .unwrap();
        assert_eq!(
            order,
            vec![
                (None, "linker".to_string()),
                (Some("linker".to_string()), "compiler".to_string())
            ]
        );
    }

    #[test]
    fn cycle_is_reported_with_all_rules() {
        let a = rule("a", &["t2"], &["t1"]);
        let b = rule("b", &["t1"], &["t2"]);
        let c = rule("top", &["t1"], &["application"]);
        let graph = RuleGraph::build(&[a, b, c], &file_tags(["application"]));
        let err = graph.traverse(&mut |_, _| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
        let msg = err.message();
        assert!(msg.contains("rule a"), "{msg}");
        assert!(msg.contains("rule b"), "{msg}");
    }

    #[test]
    fn excluded_inputs_break_edges() {
        let producer = rule("producer", &[], &["generated-c"]);
        let mut consumer_rule = Rule {
            name: "consumer".to_string(),
            inputs: file_tags(["generated-c"]),
            excluded_inputs: file_tags(["generated-c"]),
            output_file_tags: file_tags(["application"]),
            requires_inputs: true,
            ..Default::default()
        };
        consumer_rule.prepare_script = ScriptSource::new("[]", CodeLocation::new("p.qry", 2, 1));
        let consumer = Arc::new(consumer_rule);
        let graph = RuleGraph::build(&[producer, consumer], &file_tags(["application"]));
        let mut visited = Vec::new();
        graph.traverse(&mut |_, rule| visited.push(rule.name.clone())).unwrap();
        assert_eq!(visited, ["consumer"]);
    }
}
