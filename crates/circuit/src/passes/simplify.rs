use crate::{
    circuit::{Circuit, CircuitRewriter, OperatorKind},
    error::{CompilerResult, Diagnostic, ErrorReporter},
    eval::{cast_value, evaluate_constant, round_decimal, EvalError, Value},
    ids::OperatorId,
    ir::{expr::is_lossless_cast, BinaryOp, Closure, Expr, ExprKind, Literal, Type, UnaryOp},
};

/// Folds constants and removes redundant constructs from expressions
///
/// Rewrites are local to the expression being simplified and never change
/// its type. Folds which would fail at runtime, e.g. a division by zero or
/// a cast that's out of range, are reported as warnings and left in place
pub struct Simplifier<'a, R: ?Sized> {
    reporter: &'a mut R,
    operator: Option<OperatorId>,
}

impl<'a, R> Simplifier<'a, R>
where
    R: ErrorReporter + ?Sized,
{
    pub fn new(reporter: &'a mut R) -> Self {
        Self {
            reporter,
            operator: None,
        }
    }

    /// Attributes reported warnings to the given operator
    pub fn with_operator(mut self, operator: OperatorId) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn simplify(&mut self, expr: &Expr) -> Expr {
        expr.rewrite_bottom_up(&mut |expr| self.rewrite(expr))
    }

    pub fn simplify_closure(&mut self, closure: &Closure) -> Closure {
        closure.with_body(self.simplify(closure.body()))
    }

    /// Applies rules to the root of an expression whose children are
    /// already simplified until none of them match
    fn rewrite(&mut self, mut expr: Expr) -> Expr {
        while let Some(rewritten) = self.rewrite_root(&expr) {
            expr = rewritten;
        }
        expr
    }

    fn rewrite_root(&mut self, expr: &Expr) -> Option<Expr> {
        let rewritten = match expr.kind() {
            ExprKind::IsNull(inner) => is_null(inner),

            // x.clone().clone() => x.clone()
            ExprKind::Clone(inner) => match inner.kind() {
                ExprKind::Clone(_) | ExprKind::Literal(_) => Some(inner.clone()),
                _ => None,
            },

            // *&x => x
            ExprKind::Deref(inner) => match inner.kind() {
                ExprKind::Borrow(value) => Some(value.clone()),
                _ => None,
            },

            // &*x => x
            ExprKind::Borrow(inner) => match inner.kind() {
                ExprKind::Deref(reference) => Some(reference.clone()),
                _ => None,
            },

            ExprKind::Field(tuple, idx) => match tuple.kind() {
                ExprKind::Tuple(fields) | ExprKind::RawTuple(fields) => fields.get(*idx).cloned(),
                _ => None,
            },

            ExprKind::Cast(inner) => self.cast(expr, inner),
            ExprKind::Unary(op, inner) => self.unary(expr, *op, inner),
            ExprKind::Binary(op, lhs, rhs) => self.binary(expr, *op, lhs, rhs),

            ExprKind::If {
                condition,
                positive,
                negative,
            } => match condition.as_literal() {
                Some(Literal::Bool(Some(true))) => Some(positive.clone()),
                Some(literal) if literal.is_null_value() || literal.as_bool() == Some(false) => {
                    Some(negative.clone())
                }
                _ if positive == negative => Some(positive.clone()),
                _ => None,
            },

            ExprKind::Let { name, init, body } => {
                let uses = body.count_uses(name);
                if uses == 0 {
                    Some(body.clone())
                } else if uses == 1 || init.is_literal() || init.as_var().is_some() {
                    Some(self.simplify(&body.substitute(name, init)))
                } else {
                    None
                }
            }

            ExprKind::Literal(_)
            | ExprKind::Var(_)
            | ExprKind::Tuple(_)
            | ExprKind::RawTuple(_)
            | ExprKind::Call { .. } => None,
        };

        rewritten.filter(|rewritten| rewritten.ty() == expr.ty() && rewritten != expr)
    }

    fn warn(&mut self, title: &str, message: String) {
        self.reporter
            .report(Diagnostic::warning(title, message).with_operator(self.operator));
    }

    fn cast(&mut self, expr: &Expr, inner: &Expr) -> Option<Expr> {
        let target = expr.ty();
        if inner.ty() == target {
            return Some(inner.clone());
        }

        match inner.kind() {
            // A lossless cast followed by another cast is just the outer cast
            ExprKind::Cast(source) if is_lossless_cast(source.ty(), inner.ty()) => {
                Some(source.cast(target.clone()))
            }

            ExprKind::Literal(literal) => {
                let value = Value::from_literal(literal);
                match cast_value(value.clone(), inner.ty(), target) {
                    Ok(result) => {
                        if let Value::Decimal(original) = value {
                            if target.is_decimal() && round_decimal(original, target, false) != original
                            {
                                self.warn(
                                    "Precision loss",
                                    format!("converting {original} to {target} loses precision"),
                                );
                            }
                        }
                        literal_expr(&result, target)
                    }

                    Err(EvalError::NotANumber { value }) => {
                        self.warn("Not a number", format!("'{value}' is not a number"));
                        None
                    }
                    Err(EvalError::OutOfRange { value, ty }) => {
                        self.warn("Out of range", format!("value {value} is out of range for {ty}"));
                        None
                    }
                    Err(error) => {
                        self.warn("Invalid cast", format!("cannot fold {expr}: {error}"));
                        None
                    }
                }
            }

            _ => None,
        }
    }

    fn unary(&mut self, expr: &Expr, op: UnaryOp, inner: &Expr) -> Option<Expr> {
        if inner.is_null_literal() {
            return Some(Expr::null(expr.ty()));
        }

        match (op, inner.kind()) {
            // !!x => x
            (UnaryOp::Not, ExprKind::Unary(UnaryOp::Not, value)) => Some(value.clone()),
            (_, ExprKind::Literal(_)) => self.fold(expr),
            _ => None,
        }
    }

    fn binary(&mut self, expr: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
        if op.is_logical() {
            return self.logical(expr, op, lhs, rhs);
        }

        if lhs.is_null_literal() || rhs.is_null_literal() {
            return Some(Expr::null(expr.ty()));
        }
        if lhs.is_literal() && rhs.is_literal() {
            return self.fold(expr);
        }

        let left = lhs.as_literal();
        let right = rhs.as_literal();
        let is = |literal: Option<&Literal>, check: fn(&Literal) -> bool| literal.map_or(false, check);

        match op {
            BinaryOp::Add if is(right, Literal::is_zero) => Some(lhs.clone()),
            BinaryOp::Add if is(left, Literal::is_zero) => Some(rhs.clone()),
            BinaryOp::Sub if is(right, Literal::is_zero) => Some(lhs.clone()),

            BinaryOp::Mul if is(right, Literal::is_one) => Some(lhs.clone()),
            BinaryOp::Mul if is(left, Literal::is_one) => Some(rhs.clone()),
            // Zero only absorbs operands which can't be null
            BinaryOp::Mul if is(right, Literal::is_zero) && !lhs.ty().is_nullable() => {
                zero(expr.ty())
            }
            BinaryOp::Mul if is(left, Literal::is_zero) && !rhs.ty().is_nullable() => {
                zero(expr.ty())
            }

            BinaryOp::Div if is(right, Literal::is_one) => Some(lhs.clone()),
            BinaryOp::Mod if is(right, Literal::is_one) && !lhs.ty().is_nullable() => {
                zero(expr.ty())
            }
            BinaryOp::Div | BinaryOp::Mod if is(right, Literal::is_zero) => {
                self.warn("Division by zero", format!("{expr} divides by a constant zero"));
                None
            }

            _ => None,
        }
    }

    fn logical(&mut self, expr: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
        if lhs.is_literal() && rhs.is_literal() {
            return self.fold(expr);
        }

        let left = lhs.as_literal().and_then(Literal::as_bool);
        let right = rhs.as_literal().and_then(Literal::as_bool);
        let absorbing = op == BinaryOp::Or;

        if left == Some(absorbing) || right == Some(absorbing) {
            Some(Expr::literal(Literal::Bool(Some(absorbing)), expr.ty().clone()))
        } else if left == Some(!absorbing) {
            Some(rhs.clone())
        } else if right == Some(!absorbing) {
            Some(lhs.clone())
        } else {
            None
        }
    }

    /// Evaluates an expression whose operands are literals
    fn fold(&mut self, expr: &Expr) -> Option<Expr> {
        match evaluate_constant(expr) {
            Ok(value) => {
                let folded = literal_expr(&value, expr.ty());
                if folded.is_none() {
                    self.warn("Overflow", format!("{expr} overflows {}", expr.ty()));
                }
                folded
            }
            Err(EvalError::DivisionByZero) => {
                self.warn("Division by zero", format!("{expr} divides by a constant zero"));
                None
            }
            Err(error) => {
                self.warn("Overflow", format!("cannot fold {expr}: {error}"));
                None
            }
        }
    }
}

fn is_null(inner: &Expr) -> Option<Expr> {
    let is_null = match inner.as_literal() {
        Some(literal) => literal.is_null_value(),
        None if !inner.ty().is_nullable() => false,
        None => return None,
    };
    Some(Expr::bool(is_null))
}

fn literal_expr(value: &Value, ty: &Type) -> Option<Expr> {
    value
        .to_literal(ty)
        .map(|literal| Expr::literal(literal, ty.clone()))
}

fn zero(ty: &Type) -> Option<Expr> {
    let literal = match ty {
        Type::Int { .. } => Literal::Int(Some(0)),
        Type::Decimal { .. } => Literal::Decimal(Some(rust_decimal::Decimal::ZERO)),
        _ => return None,
    };
    Some(Expr::literal(literal, ty.clone()))
}

/// Simplifies every expression embedded within the circuit
#[tracing::instrument(skip_all)]
pub fn simplify_circuit<R>(circuit: &Circuit, reporter: &mut R) -> CompilerResult<Circuit>
where
    R: ErrorReporter + ?Sized,
{
    let mut rewriter = CircuitRewriter::new(circuit);

    for operator in circuit.operators() {
        let mut simplifier = Simplifier::new(&mut *reporter).with_operator(operator.id());
        let kind = operator
            .kind()
            .try_map_closures(|closure| Ok(simplifier.simplify_closure(closure)))?;

        let kind = match kind {
            OperatorKind::Constant { row, rows } => OperatorKind::Constant {
                row,
                rows: rows
                    .iter()
                    .map(|(expr, weight)| (simplifier.simplify(expr), *weight))
                    .collect(),
            },
            OperatorKind::Delay {
                initial: Some(initial),
            } => OperatorKind::Delay {
                initial: Some(simplifier.simplify(&initial)),
            },
            OperatorKind::Waterline { init, extract } => OperatorKind::Waterline {
                init: simplifier.simplify(&init),
                extract,
            },
            kind => kind,
        };

        if &kind != operator.kind() {
            tracing::debug!("simplified the expressions of {}", operator.id());
        }
        rewriter.rebuild(operator, kind)?;
    }

    rewriter.finish()
}

#[cfg(test)]
mod tests {
    use super::{simplify_circuit, Simplifier};
    use crate::{
        circuit::{Circuit, OperatorKind},
        error::Diagnostics,
        eval::{evaluate, Value},
        ir::{BinaryOp, Closure, Expr, Literal, Type, UnaryOp},
    };
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn simplify(expr: &Expr) -> (Expr, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let simplified = Simplifier::new(&mut diagnostics).simplify(expr);
        (simplified, diagnostics)
    }

    fn x() -> Expr {
        Expr::var("x", Type::i32())
    }

    fn nullable_x() -> Expr {
        Expr::var("x", Type::i32().with_nullable(true))
    }

    #[test]
    fn out_of_range_casts_are_left_unfolded() {
        let cast = Expr::string("256").cast(Type::i8());
        let (simplified, diagnostics) = simplify(&cast);
        assert_eq!(simplified, cast);
        assert_eq!(diagnostics.warnings().count(), 1);
        assert_eq!(diagnostics.iter().next().unwrap().title, "Out of range");

        let (simplified, diagnostics) = simplify(&Expr::string("12").cast(Type::i8()));
        assert_eq!(simplified, Expr::int(12, crate::ir::IntWidth::I8));
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn non_numeric_strings() {
        let cast = Expr::string("twelve").cast(Type::i32());
        let (simplified, diagnostics) = simplify(&cast);
        assert_eq!(simplified, cast);
        assert_eq!(diagnostics.iter().next().unwrap().title, "Not a number");
    }

    #[test]
    fn decimal_casts() {
        let (simplified, diagnostics) = simplify(&Expr::string("1.125").cast(Type::decimal(5, 2)));
        assert_eq!(simplified, Expr::decimal(Decimal::new(112, 2), 5, 2));
        assert!(diagnostics.is_empty());

        let (simplified, diagnostics) =
            simplify(&Expr::decimal(Decimal::new(1129, 3), 5, 3).cast(Type::decimal(5, 2)));
        assert_eq!(simplified, Expr::decimal(Decimal::new(112, 2), 5, 2));
        assert_eq!(diagnostics.iter().next().unwrap().title, "Precision loss");
    }

    #[test]
    fn fixed_width_strings() {
        let (simplified, _) = simplify(&Expr::string("ab").cast(Type::char(4)));
        assert_eq!(
            simplified,
            Expr::literal(Literal::String(Some("ab  ".to_owned())), Type::char(4)),
        );
    }

    #[test]
    fn cast_chains_collapse() {
        let chain = x().cast(Type::i64()).cast(Type::i32());
        assert_eq!(simplify(&chain).0, x());

        // The inner cast may truncate, so it has to stay
        let lossy = Expr::var("x", Type::i64()).cast(Type::i8()).cast(Type::i64());
        assert_eq!(simplify(&lossy).0, lossy);
    }

    #[test]
    fn arithmetic_identities() {
        let add = Expr::binary(BinaryOp::Add, &x(), &Expr::i32(0));
        assert_eq!(simplify(&add).0, x());

        let mul = Expr::binary(BinaryOp::Mul, &Expr::i32(1), &x());
        assert_eq!(simplify(&mul).0, x());

        let mul = Expr::binary(BinaryOp::Mul, &x(), &Expr::i32(0));
        assert_eq!(simplify(&mul).0, Expr::i32(0));

        // NULL * 0 is NULL
        let mul = Expr::binary(BinaryOp::Mul, &nullable_x(), &Expr::i32(0));
        assert_eq!(simplify(&mul).0, mul);

        let null = Expr::binary(BinaryOp::Add, &x(), &Expr::null(&Type::i32()));
        assert_eq!(simplify(&null).0, Expr::null(&Type::i32()));

        let folded = Expr::binary(BinaryOp::Add, &Expr::i32(2), &Expr::i32(3));
        assert_eq!(simplify(&folded).0, Expr::i32(5));
    }

    #[test]
    fn division_by_zero() {
        let div = Expr::binary(BinaryOp::Div, &x(), &Expr::i32(0));
        let (simplified, diagnostics) = simplify(&div);
        assert_eq!(simplified, div);
        assert_eq!(diagnostics.iter().next().unwrap().title, "Division by zero");

        let overflow = Expr::binary(BinaryOp::Add, &Expr::i32(i32::MAX), &Expr::i32(1));
        let (simplified, diagnostics) = simplify(&overflow);
        assert_eq!(simplified, overflow);
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn three_valued_logic() {
        let b = Expr::var("b", Type::Bool { nullable: true });
        let and = Expr::binary(BinaryOp::And, &b, &Expr::bool(false));
        assert_eq!(
            simplify(&and).0,
            Expr::literal(Literal::Bool(Some(false)), Type::Bool { nullable: true }),
        );

        let and = Expr::binary(BinaryOp::And, &Expr::bool(true), &b);
        assert_eq!(simplify(&and).0, b);

        let or = Expr::binary(BinaryOp::Or, &b, &Expr::bool(true));
        assert_eq!(
            simplify(&or).0,
            Expr::literal(Literal::Bool(Some(true)), Type::Bool { nullable: true }),
        );

        let null_and_true = Expr::binary(
            BinaryOp::And,
            &Expr::null(&Type::bool()),
            &Expr::bool(true),
        );
        assert_eq!(simplify(&null_and_true).0, Expr::null(&Type::bool()));

        let not_not = Expr::unary(UnaryOp::Not, &Expr::unary(UnaryOp::Not, &b));
        assert_eq!(simplify(&not_not).0, b);
    }

    #[test]
    fn references_and_conditionals() {
        let t = Expr::var("t", Type::tuple([Type::i32(), Type::i32()]).reference());
        let expr = t.deref().borrow().deref().field(0).clone_value().clone_value();
        assert_eq!(simplify(&expr).0, t.deref().field(0).clone_value());

        let branch = Expr::if_then_else(&Expr::bool(true), &x(), &Expr::i32(1));
        assert_eq!(simplify(&branch).0, x());

        let null_condition = Expr::if_then_else(&Expr::null(&Type::bool()), &x(), &Expr::i32(1));
        assert_eq!(simplify(&null_condition).0, Expr::i32(1));

        assert_eq!(simplify(&x().test_null()).0, Expr::bool(false));
        assert_eq!(simplify(&nullable_x().test_null()).0, nullable_x().test_null());

        let field = Expr::tuple(vec![x(), Expr::i32(2)]).field(1);
        assert_eq!(simplify(&field).0, Expr::i32(2));
    }

    #[test]
    fn let_bindings_are_inlined() {
        let y = Expr::var("y", Type::i32());
        let expr = Expr::let_in(
            "y",
            &Expr::i32(0),
            &Expr::binary(BinaryOp::Add, &x(), &y),
        );
        assert_eq!(simplify(&expr).0, x());
    }

    #[test]
    fn unchanged_circuits_keep_their_operators() {
        let row = Type::tuple([Type::i32(), Type::i32()]);
        let mut circuit = Circuit::new();
        let source = circuit
            .add(
                OperatorKind::Source {
                    name: "t".to_owned(),
                    row: row.clone(),
                    columns: Vec::new(),
                },
                &[],
            )
            .unwrap();
        let filter = circuit
            .add(
                OperatorKind::Filter {
                    predicate: Closure::unary("t", row.reference(), |t| {
                        Expr::binary(
                            BinaryOp::Lt,
                            &t.deref().field(0),
                            &Expr::binary(BinaryOp::Add, &Expr::i32(1), &Expr::i32(2)),
                        )
                    }),
                },
                &[source],
            )
            .unwrap();

        let mut diagnostics = Diagnostics::new();
        let simplified = simplify_circuit(&circuit, &mut diagnostics).unwrap();
        assert!(Arc::ptr_eq(
            simplified.get(source).unwrap(),
            circuit.get(source).unwrap(),
        ));
        assert!(!simplified.contains(filter));

        let filter = simplified.operators().last().unwrap();
        let OperatorKind::Filter { predicate } = filter.kind() else {
            panic!("expected a filter");
        };
        assert_eq!(predicate.body().to_string(), "((*t).0 < 3)");

        // A second run has nothing left to do
        let again = simplify_circuit(&simplified, &mut diagnostics).unwrap();
        assert_eq!(again, simplified);
    }

    fn int_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            (-3i32..4).prop_map(Expr::i32),
            Just(x()),
            Just(Expr::var("y", Type::i32().with_nullable(true))),
            Just(Expr::null(&Type::i32())),
            (-3i32..300).prop_map(|value| Expr::string(value.to_string()).cast(Type::i32())),
        ];

        leaf.prop_recursive(4, 32, 3, |inner| {
            let op = prop_oneof![
                Just(BinaryOp::Add),
                Just(BinaryOp::Sub),
                Just(BinaryOp::Mul),
                Just(BinaryOp::Div),
                Just(BinaryOp::Mod),
                Just(BinaryOp::Max),
            ];
            let logical = prop_oneof![Just(BinaryOp::And), Just(BinaryOp::Or)];

            prop_oneof![
                (op, inner.clone(), inner.clone())
                    .prop_map(|(op, lhs, rhs)| Expr::binary(op, &lhs, &rhs)),
                inner.clone().prop_map(|expr| Expr::unary(UnaryOp::Neg, &expr)),
                inner
                    .clone()
                    .prop_map(|expr| expr.cast(Type::i64()).cast(Type::i32())),
                (logical, inner.clone(), inner.clone(), inner.clone(), inner.clone()).prop_map(
                    |(op, a, b, c, d)| {
                        let condition = Expr::binary(
                            op,
                            &Expr::binary(BinaryOp::Lt, &a, &b),
                            &Expr::unary(UnaryOp::Not, &c.test_null()),
                        );
                        Expr::if_then_else(&condition, &c, &d)
                    },
                ),
                (inner.clone(), inner).prop_map(|(init, body)| {
                    let body = Expr::binary(BinaryOp::Add, &body, &Expr::var("z", init.ty().clone()));
                    Expr::let_in("z", &init, &body)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn simplification_is_idempotent(expr in int_expr()) {
            let (once, _) = simplify(&expr);
            let (twice, _) = simplify(&once);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.ty(), expr.ty());
        }

        #[test]
        fn simplification_preserves_values(expr in int_expr(), x in -5i64..5, y in prop::option::of(-5i64..5)) {
            let (simplified, _) = simplify(&expr);
            let bindings = || vec![
                ("x", Value::Int(x)),
                ("y", y.map_or(Value::Null, Value::Int)),
            ];

            if let Ok(expected) = evaluate(&expr, &mut bindings()) {
                prop_assert_eq!(evaluate(&simplified, &mut bindings()), Ok(expected));
            }
        }
    }
}
