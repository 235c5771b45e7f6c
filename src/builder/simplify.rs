//! Predicate and expression simplification.

use crate::alg::rex::{eval_call, Op, Rex};
use crate::alg::types::DataType;
use crate::alg::value::Value;

/// Returns an equivalent, usually smaller expression.
///
/// Folds constant calls, flattens nested `AND`/`OR`, drops `TRUE` conjuncts and
/// `FALSE` disjuncts, removes duplicate operands, and resolves null tests on
/// non-nullable operands.
pub fn simplify(rex: &Rex) -> Rex {
    match rex {
        Rex::Call { op, operands, ty } => {
            let operands: Vec<Rex> = operands.iter().map(simplify).collect();
            match op {
                Op::And => simplify_and(operands),
                Op::Or => simplify_or(operands),
                Op::Not => simplify_not(operands),
                Op::IsNull | Op::IsNotNull => simplify_null_test(*op, operands),
                _ => fold(*op, operands, ty.clone()),
            }
        }
        other => other.clone(),
    }
}

/// True when `rex` can never evaluate to `TRUE` (`FALSE` or a null literal).
pub fn is_always_false(rex: &Rex) -> bool {
    rex.is_false() || matches!(rex, Rex::Literal { value: Value::Null, .. })
}

fn simplify_and(operands: Vec<Rex>) -> Rex {
    let mut terms: Vec<Rex> = Vec::new();
    for operand in operands {
        for term in operand.conjunctions() {
            if is_always_false(&term) {
                return Rex::false_lit();
            }
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
    }
    let contradiction = terms.iter().any(|t| match t {
        Rex::Call {
            op: Op::Not,
            operands,
            ..
        } => operands.first().map(|inner| terms.contains(inner)).unwrap_or(false),
        _ => false,
    });
    if contradiction {
        return Rex::false_lit();
    }
    Rex::and_all(terms)
}

fn simplify_or(operands: Vec<Rex>) -> Rex {
    let mut terms: Vec<Rex> = Vec::new();
    for operand in operands {
        let flattened = match operand {
            Rex::Call {
                op: Op::Or,
                operands,
                ..
            } => operands,
            other => vec![other],
        };
        for term in flattened {
            if term.is_true() {
                return Rex::true_lit();
            }
            if term.is_false() || terms.contains(&term) {
                continue;
            }
            terms.push(term);
        }
    }
    Rex::or_all(terms)
}

fn simplify_not(mut operands: Vec<Rex>) -> Rex {
    let Some(inner) = operands.pop() else {
        return Rex::call(Op::Not, operands);
    };
    match inner {
        Rex::Literal {
            value: Value::Bool(b),
            ..
        } => Rex::lit(!b),
        Rex::Call {
            op: Op::Not,
            mut operands,
            ..
        } if operands.len() == 1 => operands.remove(0),
        Rex::Call {
            op: Op::IsNull,
            operands,
            ..
        } => Rex::call(Op::IsNotNull, operands),
        Rex::Call {
            op: Op::IsNotNull,
            operands,
            ..
        } => Rex::call(Op::IsNull, operands),
        other => Rex::not(other),
    }
}

fn simplify_null_test(op: Op, operands: Vec<Rex>) -> Rex {
    if let Some(operand) = operands.first() {
        if !operand.nullable() {
            return Rex::lit(op == Op::IsNotNull);
        }
        if let Rex::Literal { value, .. } = operand {
            return Rex::lit(value.is_null() == (op == Op::IsNull));
        }
    }
    Rex::call(op, operands)
}

fn fold(op: Op, operands: Vec<Rex>, ty: DataType) -> Rex {
    if operands.iter().all(Rex::is_literal) {
        let args: Vec<Value> = operands
            .iter()
            .filter_map(|o| match o {
                Rex::Literal { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect();
        if let Ok(value) = eval_call(op, &args) {
            return if value.is_null() {
                Rex::typed_null(ty)
            } else {
                Rex::lit(value)
            };
        }
    }
    // x = x over a non-nullable input reference is always true.
    if op == Op::Eq || op == Op::Le || op == Op::Ge {
        if let [a, b] = operands.as_slice() {
            if a == b && a.as_input_ref().is_some() && !a.nullable() {
                return Rex::true_lit();
            }
        }
    }
    Rex::Call { op, operands, ty }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(i: usize, nullable: bool) -> Rex {
        Rex::InputRef {
            index: i,
            ty: DataType::BigInt,
            nullable,
        }
    }

    #[test]
    fn true_conjuncts_vanish() {
        let cond = Rex::and_all(vec![Rex::true_lit(), Rex::eq(col(0, true), Rex::lit(1i64))]);
        assert_eq!(simplify(&cond).to_string(), "=($0, 1)");
    }

    #[test]
    fn constant_false_absorbs_conjunction() {
        let cond = Rex::and_all(vec![
            Rex::eq(col(0, true), Rex::lit(1i64)),
            Rex::eq(Rex::lit(1i64), Rex::lit(2i64)),
        ]);
        assert!(simplify(&cond).is_false());
    }

    #[test]
    fn contradiction_is_false() {
        let p = Rex::eq(col(0, true), Rex::lit(1i64));
        let cond = Rex::and_all(vec![p.clone(), Rex::not(p)]);
        assert!(simplify(&cond).is_false());
    }

    #[test]
    fn null_tests_on_required_fields_fold() {
        assert!(simplify(&Rex::call(Op::IsNotNull, vec![col(0, false)])).is_true());
        assert!(simplify(&Rex::call(Op::IsNull, vec![col(0, false)])).is_false());
        let kept = simplify(&Rex::call(Op::IsNull, vec![col(0, true)]));
        assert!(matches!(kept, Rex::Call { op: Op::IsNull, .. }));
    }

    #[test]
    fn comparison_with_null_literal_is_never_true() {
        let cond = Rex::eq(Rex::lit(1i64), Rex::typed_null(DataType::BigInt));
        assert!(is_always_false(&simplify(&cond)));
    }
}
