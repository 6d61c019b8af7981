//! Surface-syntax parsers.
//!
//! Two grammars produce the same in-memory model: the flat grammar (one
//! instruction per line, wrapped as `Main`) and the function grammar
//! (`<returnType> <name> ( <params> )` headers with brace-delimited
//! bodies). Both run through one pest grammar file; operand validation
//! happens here so errors carry the offending line and text.

use pest::error::{ErrorVariant, LineColLocation};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;

use crate::program::{Function, Instruction, Program};

#[derive(Parser)]
#[grammar = "../grammar/anvil.pest"]
struct SurfaceParser;

/// Errors produced while parsing either surface grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Mnemonic not part of the grammar in this context.
    #[error("line {line}: unknown instruction '{mnemonic}'")]
    UnknownInstruction { line: usize, mnemonic: String },

    /// Wrong number of operands for a known mnemonic.
    #[error("line {line}: '{mnemonic}' expects {expected} operand(s), got {got}")]
    BadOperandCount {
        line: usize,
        mnemonic: String,
        expected: usize,
        got: usize,
    },

    /// Operand did not parse as the required integer.
    #[error("line {line}: '{mnemonic}' has non-integer operand '{operand}'")]
    NonIntegerOperand {
        line: usize,
        mnemonic: String,
        operand: String,
    },

    /// `call` operand is not a usable function name.
    #[error("line {line}: 'call' expects a function name")]
    InvalidFunctionName { line: usize },

    /// A function header was not followed by a `{` line.
    #[error("line {line}: expected '{{' to open the function body")]
    MissingOpenBrace { line: usize },

    /// Any other structural error, with pest's diagnostic message.
    #[error("parse error at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },
}

/// Which surface grammar a statement belongs to. The function grammar
/// additionally understands `call` and `loadarg`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Context {
    Flat,
    FunctionBody,
}

/// Parse flat source: one instruction per line, wrapped as a program whose
/// single function is `Main` with no parameters.
pub fn parse_flat(source: &str) -> Result<Program, ParseError> {
    let mut pairs =
        SurfaceParser::parse(Rule::flat_file, source).map_err(convert_pest_error)?;

    let mut instructions = Vec::new();
    if let Some(file) = pairs.next() {
        for pair in file.into_inner() {
            if pair.as_rule() == Rule::statement {
                instructions.push(parse_statement(pair, Context::Flat)?);
            }
        }
    }

    Ok(Program::from_instructions(instructions))
}

/// Parse function-grammar source into a multi-function program.
pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let mut pairs =
        SurfaceParser::parse(Rule::program_file, source).map_err(convert_pest_error)?;

    let mut program = Program::new();
    if let Some(file) = pairs.next() {
        for pair in file.into_inner() {
            if pair.as_rule() == Rule::function {
                program.push(parse_function(pair)?);
            }
        }
    }

    Ok(program)
}

fn parse_function(pair: Pair<Rule>) -> Result<Function, ParseError> {
    let mut name = String::new();
    let mut return_type = String::new();
    let mut params = Vec::new();
    let mut body = Vec::new();

    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::header => {
                let mut inner = item.into_inner();
                if let Some(ty) = inner.next() {
                    return_type = ty.as_str().to_string();
                }
                if let Some(n) = inner.next() {
                    name = n.as_str().to_string();
                }
                if let Some(list) = inner.next() {
                    for param in list.into_inner() {
                        params.push(param.as_str().to_string());
                    }
                }
            }
            Rule::statement => {
                body.push(parse_statement(item, Context::FunctionBody)?);
            }
            Rule::body_open | Rule::body_close => {}
            _ => {}
        }
    }

    Ok(Function {
        name,
        return_type,
        params,
        body,
    })
}

fn parse_statement(pair: Pair<Rule>, context: Context) -> Result<Instruction, ParseError> {
    let line = pair.as_span().start_pos().line_col().0;

    let tokens: Vec<String> = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::token)
        .map(|p| p.as_str().to_string())
        .collect();

    let mnemonic = tokens[0].to_lowercase();
    let operands = &tokens[1..];

    match mnemonic.as_str() {
        "load" => {
            let operand = expect_one_operand(line, &mnemonic, operands)?;
            let value = operand
                .parse::<i64>()
                .map_err(|_| ParseError::NonIntegerOperand {
                    line,
                    mnemonic: mnemonic.clone(),
                    operand: operand.to_string(),
                })?;
            Ok(Instruction::LoadImm(value))
        }
        "add" => no_operands(line, &mnemonic, operands, Instruction::Add),
        "sub" => no_operands(line, &mnemonic, operands, Instruction::Sub),
        "mul" => no_operands(line, &mnemonic, operands, Instruction::Mul),
        "div" => no_operands(line, &mnemonic, operands, Instruction::Div),
        "print" => no_operands(line, &mnemonic, operands, Instruction::Print),
        "ret" | "return" => no_operands(line, &mnemonic, operands, Instruction::Return),
        "call" if context == Context::FunctionBody => {
            let operand = expect_one_operand(line, &mnemonic, operands)?;
            if operand.is_empty() || operand.parse::<i64>().is_ok() {
                return Err(ParseError::InvalidFunctionName { line });
            }
            Ok(Instruction::Call(operand.to_string()))
        }
        "loadarg" if context == Context::FunctionBody => {
            let operand = expect_one_operand(line, &mnemonic, operands)?;
            let index = operand
                .parse::<u32>()
                .map_err(|_| ParseError::NonIntegerOperand {
                    line,
                    mnemonic: mnemonic.clone(),
                    operand: operand.to_string(),
                })?;
            Ok(Instruction::LoadArg(index))
        }
        _ => Err(ParseError::UnknownInstruction {
            line,
            mnemonic: tokens[0].clone(),
        }),
    }
}

fn expect_one_operand<'a>(
    line: usize,
    mnemonic: &str,
    operands: &'a [String],
) -> Result<&'a str, ParseError> {
    if operands.len() != 1 {
        return Err(ParseError::BadOperandCount {
            line,
            mnemonic: mnemonic.to_string(),
            expected: 1,
            got: operands.len(),
        });
    }
    Ok(&operands[0])
}

fn no_operands(
    line: usize,
    mnemonic: &str,
    operands: &[String],
    instruction: Instruction,
) -> Result<Instruction, ParseError> {
    if !operands.is_empty() {
        return Err(ParseError::BadOperandCount {
            line,
            mnemonic: mnemonic.to_string(),
            expected: 0,
            got: operands.len(),
        });
    }
    Ok(instruction)
}

fn convert_pest_error(e: pest::error::Error<Rule>) -> ParseError {
    let (line, column) = match e.line_col {
        LineColLocation::Pos((l, c)) => (l, c),
        LineColLocation::Span((l, c), _) => (l, c),
    };

    if let ErrorVariant::ParsingError { positives, .. } = &e.variant {
        if positives.contains(&Rule::body_open) {
            return ParseError::MissingOpenBrace { line };
        }
    }

    ParseError::Syntax {
        line,
        column,
        message: e.variant.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_simple() {
        let program = parse_flat("load 10\nload 5\nadd\nret\n").unwrap();
        let main = program.main().unwrap();
        assert_eq!(
            main.body,
            vec![
                Instruction::LoadImm(10),
                Instruction::LoadImm(5),
                Instruction::Add,
                Instruction::Return,
            ]
        );
        assert_eq!(main.arity(), 0);
    }

    #[test]
    fn test_parse_flat_comments_and_blanks() {
        let source = "\n# push two values\nload 1\n\n// and combine\nload 2  # trailing\nadd\n";
        let program = parse_flat(source).unwrap();
        assert_eq!(program.main().unwrap().body.len(), 3);
    }

    #[test]
    fn test_parse_flat_case_insensitive() {
        let program = parse_flat("LOAD 3\nAdd\nRETURN\n").unwrap();
        assert_eq!(
            program.main().unwrap().body,
            vec![
                Instruction::LoadImm(3),
                Instruction::Add,
                Instruction::Return
            ]
        );
    }

    #[test]
    fn test_parse_flat_extreme_literals() {
        let program = parse_flat("load -9223372036854775808\nload 9223372036854775807\n").unwrap();
        assert_eq!(
            program.main().unwrap().body,
            vec![
                Instruction::LoadImm(i64::MIN),
                Instruction::LoadImm(i64::MAX)
            ]
        );
    }

    #[test]
    fn test_parse_flat_unknown_instruction() {
        let err = parse_flat("frobnicate\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownInstruction {
                line: 1,
                mnemonic: "frobnicate".to_string()
            }
        );
    }

    #[test]
    fn test_parse_flat_rejects_function_ops() {
        // `call` and `loadarg` belong to the function grammar only.
        assert!(matches!(
            parse_flat("call Helper\n"),
            Err(ParseError::UnknownInstruction { .. })
        ));
        assert!(matches!(
            parse_flat("loadarg 0\n"),
            Err(ParseError::UnknownInstruction { .. })
        ));
    }

    #[test]
    fn test_parse_flat_operand_count() {
        let err = parse_flat("load\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::BadOperandCount {
                line: 1,
                mnemonic: "load".to_string(),
                expected: 1,
                got: 0
            }
        );

        let err = parse_flat("add 1\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::BadOperandCount {
                line: 1,
                mnemonic: "add".to_string(),
                expected: 0,
                got: 1
            }
        );
    }

    #[test]
    fn test_parse_flat_non_integer_operand() {
        let err = parse_flat("load ten\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::NonIntegerOperand {
                line: 1,
                mnemonic: "load".to_string(),
                operand: "ten".to_string()
            }
        );
    }

    #[test]
    fn test_parse_program_two_functions() {
        let source = "\
int Main()
{
load 10
load 5
call Step1
ret
}

int Step1(int, int)
{
loadarg 0
loadarg 1
add
ret
}
";
        let program = parse_program(source).unwrap();
        assert_eq!(program.len(), 2);

        let main = program.main().unwrap();
        assert_eq!(main.return_type, "int");
        assert_eq!(main.arity(), 0);
        assert_eq!(main.body[2], Instruction::Call("Step1".to_string()));

        let step1 = program.get("Step1").unwrap();
        assert_eq!(step1.arity(), 2);
        assert_eq!(step1.params, vec!["int".to_string(), "int".to_string()]);
        assert_eq!(step1.body[0], Instruction::LoadArg(0));
    }

    #[test]
    fn test_parse_program_missing_open_brace() {
        let source = "int Main()\nload 1\nret\n}\n";
        let err = parse_program(source).unwrap_err();
        assert!(matches!(err, ParseError::MissingOpenBrace { .. }));
    }

    #[test]
    fn test_parse_program_loadarg_must_be_non_negative() {
        let source = "int F(int)\n{\nloadarg -1\nret\n}\n";
        let err = parse_program(source).unwrap_err();
        assert!(matches!(err, ParseError::NonIntegerOperand { .. }));
    }

    #[test]
    fn test_parse_program_call_needs_name() {
        let source = "int Main()\n{\ncall 42\nret\n}\n";
        let err = parse_program(source).unwrap_err();
        assert_eq!(err, ParseError::InvalidFunctionName { line: 3 });
    }

    #[test]
    fn test_flat_round_trip() {
        let source = "load 100\nload 50\nsub\nload 3\ndiv\nload 4\nmul\nret\n";
        let program = parse_flat(source).unwrap();
        let serialized = program.to_flat_source().unwrap();
        let reparsed = parse_flat(&serialized).unwrap();
        assert_eq!(program, reparsed);
    }
}
