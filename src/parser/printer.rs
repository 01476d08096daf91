use std::fmt::Write as _;

use crate::parser::ast::{
    Callee, CondStmt, Expr, LiteralValue, MatchStmt, Stmt, Symbol, UnitSym, GLOBAL_SCOPE,
};
use crate::vm::instruction::Opcode;

/// Prints a parsed unit back to source form. The output reparses to a
/// structurally identical tree, which makes printing idempotent; tests
/// lean on that law.
pub fn print_unit(unit: &UnitSym) -> String {
    let mut out = String::new();

    for (name, path) in &unit.imports {
        if path.is_empty() {
            let _ = writeln!(out, "import {};", name);
        } else {
            let _ = writeln!(out, "import {} from '{}';", name, escape_string(path));
        }
    }

    for id in unit.scope_symbols(GLOBAL_SCOPE) {
        match unit.symbol(*id) {
            Symbol::Variable(var) => {
                let _ = writeln!(out, "var {} = {};", var.name, print_expr(&var.initializer));
            }
            Symbol::Handler(handler) => match &handler.body {
                Some(body) => {
                    let _ = writeln!(out, "handler {} {}", handler.name, print_stmt(body, 0));
                }
                None => {
                    // forward declarations synthesized at call sites are
                    // not printed; explicit ones keep their form
                    if !handler.name.starts_with("__lambda_") {
                        let _ = writeln!(out, "handler {};", handler.name);
                    }
                }
            },
            Symbol::BuiltinFunction(_) | Symbol::BuiltinHandler(_) => {}
        }
    }

    out
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

pub fn print_stmt(stmt: &Stmt, depth: usize) -> String {
    match stmt {
        Stmt::Expr(s) => match &s.expr {
            Expr::Call(call) => {
                if call.args.is_empty() {
                    format!("{};", call.name)
                } else {
                    let args: Vec<String> =
                        call.args.values.iter().map(print_expr).collect();
                    format!("{}({});", call.name, args.join(", "))
                }
            }
            other => format!("{};", print_expr(other)),
        },
        Stmt::Compound(s) => {
            if s.stmts.is_empty() {
                return "{ }".to_string();
            }
            let mut out = String::from("{\n");
            for stmt in &s.stmts {
                let _ = writeln!(out, "{}{}", indent(depth + 1), print_stmt(stmt, depth + 1));
            }
            let _ = write!(out, "{}}}", indent(depth));
            out
        }
        Stmt::Cond(s) => print_cond(s, depth),
        Stmt::While(s) => format!(
            "while {} {}",
            print_expr(&s.condition),
            print_stmt(&s.body, depth)
        ),
        Stmt::Match(s) => print_match(s, depth),
        Stmt::Assign(s) => format!("{} = {};", s.name, print_expr(&s.expr)),
    }
}

fn print_cond(s: &CondStmt, depth: usize) -> String {
    let mut out = format!(
        "if {} then {}",
        print_condition(&s.condition),
        print_stmt(&s.then_stmt, depth)
    );
    if let Some(else_stmt) = &s.else_stmt {
        let _ = write!(out, " else {}", print_stmt(else_stmt, depth));
    }
    out
}

/// The parser rewrites string conditions to `length(s) != 0`; printing
/// the original string form reproduces the same tree on reparse.
fn print_condition(cond: &Expr) -> String {
    if let Expr::Binary(b) = cond {
        if b.op == Opcode::NCmpNe {
            if let (Expr::Unary(len), Expr::Literal(zero)) = (b.lhs.as_ref(), b.rhs.as_ref()) {
                if len.op == Opcode::SLen && zero.value == LiteralValue::Number(0) {
                    return print_expr(&len.expr);
                }
            }
        }
    }
    print_expr(cond)
}

fn print_match(s: &MatchStmt, depth: usize) -> String {
    let mut out = format!("match {} {} {{\n", print_expr(&s.condition), s.op);
    for case in &s.cases {
        let labels: Vec<String> = case.labels.iter().map(print_expr).collect();
        let _ = writeln!(
            out,
            "{}on {} {}",
            indent(depth + 1),
            labels.join(", on "),
            print_stmt(&case.body, depth + 1)
        );
    }
    if let Some(else_stmt) = &s.else_stmt {
        let _ = writeln!(
            out,
            "{}else {}",
            indent(depth + 1),
            print_stmt(else_stmt, depth + 1)
        );
    }
    let _ = write!(out, "{}}}", indent(depth));
    out
}

pub fn print_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(e) => print_literal(&e.value),
        Expr::Unary(e) => match e.op {
            Opcode::NNeg => format!("-({})", print_expr(&e.expr)),
            Opcode::NNot => format!("~({})", print_expr(&e.expr)),
            Opcode::BNot | Opcode::NCmpZ | Opcode::SIsEmpty => {
                format!("not ({})", print_expr(&e.expr))
            }
            Opcode::N2S | Opcode::B2S | Opcode::P2S | Opcode::C2S | Opcode::R2S => {
                format!("string({})", print_expr(&e.expr))
            }
            Opcode::S2N => format!("int({})", print_expr(&e.expr)),
            Opcode::SLen => format!("int({})", print_expr(&e.expr)),
            op => format!("/* {} */({})", op.mnemonic(), print_expr(&e.expr)),
        },
        Expr::Binary(e) => format!(
            "({} {} {})",
            print_expr(&e.lhs),
            operator_symbol(e.op),
            print_expr(&e.rhs)
        ),
        Expr::Variable(e) => e.name.clone(),
        Expr::HandlerRef(e) => e.name.clone(),
        Expr::Call(e) => {
            let args: Vec<String> = e.args.values.iter().map(print_expr).collect();
            match e.callee {
                Callee::Handler(_) => e.name.clone(),
                _ => format!("{}({})", e.name, args.join(", ")),
            }
        }
        Expr::RegExpGroup(e) => format!("${}", e.group),
        Expr::Array(e) => {
            let elements: Vec<String> = e.elements.iter().map(print_expr).collect();
            format!("[{}]", elements.join(", "))
        }
    }
}

fn print_literal(value: &LiteralValue) -> String {
    match value {
        LiteralValue::Boolean(b) => b.to_string(),
        LiteralValue::Number(n) => n.to_string(),
        LiteralValue::String(s) => format!("'{}'", escape_string(s)),
        LiteralValue::IP(ip) => ip.to_string(),
        LiteralValue::Cidr(cidr) => cidr.to_string(),
        LiteralValue::RegExp(re) => format!("/{}/", re.pattern()),
    }
}

fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn operator_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::NAdd | Opcode::SAdd => "+",
        Opcode::NSub => "-",
        Opcode::NMul => "*",
        Opcode::NDiv => "/",
        Opcode::NRem => "%",
        Opcode::NPow => "**",
        Opcode::NShl => "shl",
        Opcode::NShr => "shr",
        Opcode::NAnd => "&",
        Opcode::NOr => "|",
        Opcode::NXor => "^",
        Opcode::NCmpEq | Opcode::SCmpEq | Opcode::PCmpEq => "==",
        Opcode::NCmpNe | Opcode::SCmpNe | Opcode::PCmpNe => "!=",
        Opcode::NCmpLe | Opcode::SCmpLe => "<=",
        Opcode::NCmpGe | Opcode::SCmpGe => ">=",
        Opcode::NCmpLt | Opcode::SCmpLt => "<",
        Opcode::NCmpGt | Opcode::SCmpGt => ">",
        Opcode::SCmpBeg => "=^",
        Opcode::SCmpEnd => "=$",
        Opcode::SRegMatch => "=~",
        Opcode::SContains | Opcode::PInCidr => "in",
        Opcode::BAnd => "and",
        Opcode::BOr => "or",
        Opcode::BXor => "xor",
        other => other.mnemonic(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::diagnostics::{shared, Report};
    use crate::parser::recursive_descent::Parser;
    use crate::types::{Feature, LiteralType};
    use crate::vm::runtime::Runtime;

    fn test_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime
            .register_function("print", LiteralType::Void)
            .param("text", LiteralType::String);
        runtime
            .register_function("assert", LiteralType::Number)
            .param("condition", LiteralType::Boolean)
            .param_with_default("description", LiteralType::String, "");
        runtime.register_handler("stop");
        runtime
    }

    fn parse(runtime: &Runtime, source: &str) -> UnitSym {
        let report = shared(Report::buffered());
        let mut parser = Parser::new(
            vec![Feature::GlobalScope, Feature::WhileLoop],
            report.clone(),
            Some(runtime),
        );
        parser.open_string(source);
        let unit = parser.parse();
        assert!(
            !report.borrow().contains_failures(),
            "parse failed: {:?}",
            report.borrow().messages()
        );
        unit
    }

    fn assert_round_trip(source: &str) {
        let runtime = test_runtime();
        let printed = print_unit(&parse(&runtime, source));
        let reprinted = print_unit(&parse(&runtime, &printed));
        assert_eq!(printed, reprinted, "printing is not idempotent");
    }

    #[test]
    fn round_trip_minimal() {
        assert_round_trip("handler main {}");
    }

    #[test]
    fn round_trip_arithmetic_and_calls() {
        assert_round_trip(
            "var limit = 4 kbyte;\n\
             handler main {\n\
               var i = 2 + 3 * 4;\n\
               assert(i == 14, 'arith');\n\
               print \"i=#{i}\";\n\
             }",
        );
    }

    #[test]
    fn round_trip_control_flow() {
        assert_round_trip(
            "handler main {\n\
               if \"cond\" then stop; else { print 'no'; }\n\
               while false { stop; }\n\
               match 'x' =^ { on 'a' stop; on 'b' stop; else print 'none'; }\n\
             }",
        );
    }

    #[test]
    fn round_trip_values() {
        assert_round_trip(
            "handler main {\n\
               if 10.0.0.5 in 10.0.0.0/24 then stop;\n\
               if 'x' =~ /^x$/ then print $1;\n\
               if not (1 == 2) then stop;\n\
             }",
        );
    }

    #[test]
    fn string_escapes_survive_printing() {
        assert_round_trip("handler main { print 'a\\tb\\\\c'; }");
    }
}
