use crate::traits::{DynamicalSystem, Scalar};
use anyhow::{anyhow, bail, Result};
use std::cell::RefCell;
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a state variable (by index) onto the stack.
    /// Indices correspond to the order variables were defined (e.g., 0=u1, 1=u2).
    LoadVar(usize),
    /// Pushes the value of a parameter (by index) onto the stack.
    LoadParam(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes sin(a).
    Sin,
    /// Pops top value (a), pushes cos(a).
    Cos,
    /// Pops top value (a), pushes exp(a).
    Exp,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Evaluates with a scratch stack of its own. Prefer `VM::execute` in loops.
    pub fn evaluate<T: Scalar>(&self, vars: &[T], params: &[T]) -> T {
        let mut stack = Vec::with_capacity(16);
        VM::execute(self, vars, params, &mut stack)
    }
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Current state vector (read-only).
/// - `params`: Parameter vector (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    /// Executes the bytecode.
    ///
    /// Bytecode produced by `Compiler` is always balanced; malformed input
    /// evaluates to NaN instead of panicking.
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
            stack.pop().unwrap_or_else(T::nan)
        }

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(T::constant(*val)),
                OpCode::LoadVar(idx) => stack.push(vars.get(*idx).copied().unwrap_or_else(T::nan)),
                OpCode::LoadParam(idx) => {
                    stack.push(params.get(*idx).copied().unwrap_or_else(T::nan))
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
                OpCode::Sin => {
                    let a = pop(stack);
                    stack.push(a.sin());
                }
                OpCode::Cos => {
                    let a = pop(stack);
                    stack.push(a.cos());
                }
                OpCode::Exp => {
                    let a = pop(stack);
                    stack.push(a.exp());
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
            }
        }

        pop(stack)
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),            // functions like sin(x)
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves variable and parameter names to indices.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new<S: AsRef<str>>(var_names: &[S], param_names: &[S]) -> Self {
        let index = |names: &[S]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.as_ref().to_string(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            var_map: index(var_names),
            param_map: index(param_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    /// Parses and compiles a source string in one go.
    pub fn compile_str(&self, source: &str) -> Result<Bytecode> {
        let expr = parse(source).map_err(|e| anyhow!("Failed to parse \"{source}\": {e}"))?;
        self.compile(&expr)
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else {
                    bail!("Unknown variable or parameter: {}", name);
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => bail!("Unknown binary operator: {}", op),
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => bail!("Unknown unary operator: {}", op),
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    _ => bail!("Unknown function: {}", func),
                });
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("Unexpected trailing input at token {}", parser.pos));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("Invalid number literal '{num_str}'"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(format!("Unexpected character '{other}'")),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_power()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(Token::Caret) = self.peek() {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), '^', Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    if let Some(Token::RParen) = self.consume() {
                        Ok(Expr::Call(name, Box::new(arg)))
                    } else {
                        Err("Expected ')'".to_string())
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                if let Some(Token::RParen) = self.consume() {
                    Ok(expr)
                } else {
                    Err("Expected ')'".to_string())
                }
            }
            _ => Err("Unexpected token".to_string()),
        }
    }
}

// --- EquationSystem ---

/// A concrete implementation of `DynamicalSystem` that uses the VM.
/// Contains one compiled bytecode expression per state variable.
pub struct EquationSystem<T: Scalar = f64> {
    pub equations: Vec<Bytecode>,
    pub params: Vec<T>,
    // Interior mutability for VM stack to avoid allocation in apply.
    // Note: This makes the system !Sync; each worker builds its own.
    pub stack: RefCell<Vec<T>>,
}

impl<T: Scalar> EquationSystem<T> {
    pub fn new(equations: Vec<Bytecode>, params: Vec<T>) -> Self {
        Self {
            equations,
            params,
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }

    /// Compiles one source string per state variable.
    pub fn from_sources<S: AsRef<str>>(
        sources: &[S],
        var_names: &[S],
        param_names: &[S],
        params: Vec<T>,
    ) -> Result<Self> {
        if sources.len() != var_names.len() {
            bail!(
                "Expected one equation per state variable ({}), got {}.",
                var_names.len(),
                sources.len()
            );
        }
        if params.len() != param_names.len() {
            bail!(
                "Parameter count mismatch. Expected {}, got {}.",
                param_names.len(),
                params.len()
            );
        }
        let compiler = Compiler::new(var_names, param_names);
        let equations = sources
            .iter()
            .map(|src| compiler.compile_str(src.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(equations, params))
    }
}

impl<T: Scalar> DynamicalSystem<T> for EquationSystem<T> {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, &self.params, &mut stack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, Compiler, EquationSystem, Expr, OpCode};
    use crate::traits::DynamicalSystem;
    use approx::assert_relative_eq;

    #[test]
    fn parse_respects_precedence() {
        let expr = parse("1 + 2 * u1 ^ 2").expect("parse");
        match expr {
            Expr::Binary(_, '+', rhs) => match *rhs {
                Expr::Binary(_, '*', pow) => assert!(matches!(*pow, Expr::Binary(_, '^', _))),
                other => panic!("unexpected rhs {other:?}"),
            },
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_trailing_tokens_and_bad_characters() {
        assert!(parse("u1 u2").is_err());
        assert!(parse("u1 # u2").is_err());
        assert!(parse("sin(u1").is_err());
    }

    #[test]
    fn compile_reports_unknown_names() {
        let compiler = Compiler::new(&["u1", "u2"], &["alpha"]);
        let err = compiler.compile_str("beta * u1").expect_err("beta is unknown");
        assert!(format!("{err}").contains("Unknown variable or parameter: beta"));
        let err = compiler.compile_str("tanh(u1)").expect_err("tanh is unsupported");
        assert!(format!("{err}").contains("Unknown function"));
    }

    #[test]
    fn compiled_terms_evaluate_with_the_vm() {
        let compiler = Compiler::new(&["u1", "u2"], &["alpha"]);
        let code = compiler.compile_str("alpha * u1 ^ 2 * u2 - sin(u2)").expect("compile");
        assert_eq!(code.ops.first(), Some(&OpCode::LoadParam(0)));
        let value = code.evaluate(&[2.0, 0.5], &[3.0]);
        assert_relative_eq!(value, 3.0 * 4.0 * 0.5 - 0.5f64.sin(), epsilon = 1e-15);
    }

    #[test]
    fn equation_system_evaluates_lotka_volterra() {
        let system = EquationSystem::from_sources(
            &["alpha*u1 - beta*u1*u2", "gamma*u1*u2 - delta*u2"],
            &["u1", "u2"],
            &["alpha", "beta", "gamma", "delta"],
            vec![1.3, 0.9, 0.8, 1.8],
        )
        .expect("system should compile");
        let mut out = [0.0; 2];
        system.apply(0.0, &[1.0, 2.0], &mut out);
        assert_relative_eq!(out[0], 1.3 - 1.8, epsilon = 1e-15);
        assert_relative_eq!(out[1], 1.6 - 3.6, epsilon = 1e-15);
    }

    #[test]
    fn from_sources_checks_counts() {
        let result = EquationSystem::<f64>::from_sources(&["u1"], &["u1", "u2"], &[], vec![]);
        assert!(result.is_err());
    }
}
