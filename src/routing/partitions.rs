use crate::alg::node::{AlgNode, AlgOp};
use crate::alg::rex::{Op, Rex};
use crate::alg::value::Value;
use crate::catalog::Snapshot;
use crate::types::{PartitionId, Result};

/// Partitions a query may touch, sorted and deduplicated.
///
/// A filter directly above a scan of a partitioned entity narrows the result
/// when it pins the partition column to literals, either through an equality
/// conjunct or a disjunction of equalities. Every other scan touches all its
/// partitions.
pub fn accessed_partitions(node: &AlgNode, snapshot: &dyn Snapshot) -> Result<Vec<PartitionId>> {
    let mut ids = Vec::new();
    collect(node, snapshot, &mut ids)?;
    ids.sort();
    ids.dedup();
    Ok(ids)
}

fn collect(node: &AlgNode, snapshot: &dyn Snapshot, ids: &mut Vec<PartitionId>) -> Result<()> {
    for rex in node.op().expressions() {
        let mut nested = Vec::new();
        rex.visit(&mut |r| {
            if let Rex::SubQuery { rel, .. } = r {
                nested.push(rel.clone());
            }
        });
        for rel in &nested {
            collect(rel, snapshot, ids)?;
        }
    }
    match node.op() {
        AlgOp::Scan { entity } => {
            ids.extend(snapshot.accessed_partitions(entity.id, None)?);
            Ok(())
        }
        AlgOp::Filter { condition } => {
            let input = node.input(0)?;
            let AlgOp::Scan { entity } = input.op() else {
                return collect(input, snapshot, ids);
            };
            let def = snapshot.entity_by_id(entity.id)?;
            let column = def
                .partitioning
                .as_ref()
                .and_then(|p| input.row_type().index_of(&p.column));
            let values = column.and_then(|c| pinned_values(condition, c));
            ids.extend(snapshot.accessed_partitions(entity.id, values.as_deref())?);
            Ok(())
        }
        _ => {
            for input in node.inputs() {
                collect(input, snapshot, ids)?;
            }
            Ok(())
        }
    }
}

/// Literal values `condition` restricts field `column` to, if it does.
fn pinned_values(condition: &Rex, column: usize) -> Option<Vec<Value>> {
    condition
        .conjunctions()
        .iter()
        .find_map(|conjunct| match conjunct {
            Rex::Call {
                op: Op::Or,
                operands,
                ..
            } => operands
                .iter()
                .map(|d| equality_value(d, column))
                .collect::<Option<Vec<_>>>(),
            other => equality_value(other, column).map(|v| vec![v]),
        })
}

fn equality_value(rex: &Rex, column: usize) -> Option<Value> {
    let Rex::Call {
        op: Op::Eq,
        operands,
        ..
    } = rex
    else {
        return None;
    };
    match operands.as_slice() {
        [Rex::InputRef { index, .. }, Rex::Literal { value, .. }]
        | [Rex::Literal { value, .. }, Rex::InputRef { index, .. }]
            if *index == column =>
        {
            Some(value.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::types::DataType;
    use crate::catalog::{EntityDef, InMemorySnapshot, PartitionDef};
    use crate::types::{AdapterId, EntityId};

    fn orders() -> EntityDef {
        EntityDef::new(EntityId(1), "orders")
            .column("id", DataType::BigInt, false)
            .column("region", DataType::Varchar, false)
            .placement(AdapterId(1))
            .partitioned_by(
                "region",
                vec![
                    PartitionDef {
                        id: PartitionId(10),
                        values: vec!["eu".into()],
                    },
                    PartitionDef {
                        id: PartitionId(11),
                        values: vec!["us".into()],
                    },
                    PartitionDef {
                        id: PartitionId(12),
                        values: vec![],
                    },
                ],
            )
    }

    fn region_eq(scan: &AlgNode, value: &str) -> Rex {
        let field = &scan.row_type().fields()[1];
        Rex::eq(Rex::input(1, field), Rex::lit(value))
    }

    #[test]
    fn equality_on_partition_column_prunes() {
        let def = orders();
        let scan = AlgNode::scan(def.entity_ref(), def.row_type());
        let snapshot = InMemorySnapshot::new().with_entity(def);
        let filter = AlgNode::filter(scan.clone(), region_eq(&scan, "us"));
        assert_eq!(
            accessed_partitions(&filter, &snapshot).unwrap(),
            vec![PartitionId(11)]
        );

        let either = Rex::or_all(vec![region_eq(&scan, "eu"), region_eq(&scan, "apac")]);
        let filter = AlgNode::filter(scan.clone(), either);
        assert_eq!(
            accessed_partitions(&filter, &snapshot).unwrap(),
            vec![PartitionId(10), PartitionId(12)]
        );
    }

    #[test]
    fn unrestricted_scan_touches_every_partition() {
        let def = orders();
        let scan = AlgNode::scan(def.entity_ref(), def.row_type());
        let snapshot = InMemorySnapshot::new().with_entity(def);
        let id_filter = Rex::eq(Rex::input(0, &scan.row_type().fields()[0]), Rex::lit(1i64));
        let filter = AlgNode::filter(scan, id_filter);
        assert_eq!(
            accessed_partitions(&filter, &snapshot).unwrap(),
            vec![PartitionId(10), PartitionId(11), PartitionId(12)]
        );
    }
}
