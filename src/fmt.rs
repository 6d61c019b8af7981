//! Source Code Formatter
//!
//! Renders a parsed program back to canonical function-grammar text, and a
//! flat-expressible program back to the flat grammar. Formatting then
//! reparsing yields an equal program.

use crate::program::{Function, Program};

/// Format a program in the function grammar.
pub fn format_program(program: &Program) -> String {
    let mut output = String::new();

    for (i, function) in program.iter().enumerate() {
        if i > 0 {
            output.push('\n');
        }
        output.push_str(&format_function(function));
    }

    output
}

/// Format a single function: header, brace-delimited body, one
/// instruction per line.
fn format_function(function: &Function) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{} {}({})\n",
        function.return_type,
        function.name,
        function.params.join(", ")
    ));
    output.push_str("{\n");

    for instr in &function.body {
        output.push_str(&format!("    {}\n", instr));
    }

    output.push_str("}\n");
    output
}

/// Format a flat-expressible program in the flat grammar. `None` for
/// programs the flat grammar cannot carry (multiple functions, `call`,
/// `loadarg`).
pub fn format_flat(program: &Program) -> Option<String> {
    program.to_flat_source()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_flat, parse_program};
    use crate::program::Instruction::*;

    const SOURCE: &str = "\
int   Main ( )
{
  load 10
  LOAD 5
  call   Step1
  ret
}
int Step1(int,int)
{
  loadarg 0
  loadarg 1
  add
  ret
}
";

    #[test]
    fn test_format_canonicalizes() {
        let program = parse_program(SOURCE).unwrap();
        let formatted = format_program(&program);
        assert_eq!(
            formatted,
            "\
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
"
        );
    }

    #[test]
    fn test_format_round_trips() {
        let program = parse_program(SOURCE).unwrap();
        let formatted = format_program(&program);
        let reparsed = parse_program(&formatted).unwrap();
        assert_eq!(program, reparsed);
        // A second pass changes nothing.
        assert_eq!(format_program(&reparsed), formatted);
    }

    #[test]
    fn test_format_flat() {
        let program = parse_flat("LOAD 1\nload 2\nADD\nreturn\n").unwrap();
        assert_eq!(
            format_flat(&program).unwrap(),
            "load 1\nload 2\nadd\nret\n"
        );
    }

    #[test]
    fn test_format_flat_rejects_program_features() {
        let program = Program::from_instructions(vec![LoadArg(0), Return]);
        assert!(format_flat(&program).is_none());
    }
}
