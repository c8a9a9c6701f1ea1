use std::collections::HashMap;
use xgpt_core::{substitute, TemplateError};

pub const FINETUNE_INST: &str =
    "You are evaluating the errors in a model-generated output for a(an) ${task} task.";

// the trailing space after the severity line is part of the trained prompt
pub const FINETUNE_INPUT: &str = "\
Task instruction: ${generation_instruction}
Source: ${input_context}
Model-generated Output: ${hypothesis_output}

Based on the given task instruction and source, identify the major and minor errors in this model-generated output.
Note that Major errors refer to actual errors that affects the task severely, and Minor errors refer to small imperfections, and purely subjective opinions about the output.
For each error you give in the response, please also elaborate the following information:
- error location (the words that are wrong in the output)
- error aspect it belongs to.
- explanation why it's an error, and the correction suggestions.
- severity of the error (\"Major\" or \"Minor\"). \n\
- reduction of score (between 0.5 and 5)

Your evaluation output in the json format:
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedPrompt {
    pub instruction: String,
    pub input: String,
}

impl FormattedPrompt {
    /// The text the model is conditioned on.
    pub fn source(&self) -> String {
        format!("{}\n{}", self.instruction, self.input)
            .trim_start_matches([' ', '\n'])
            .to_owned()
    }
}

pub fn format_prompt(
    task: &str,
    instruction: &str,
    input: &str,
    hypothesis: &str,
) -> Result<FormattedPrompt, TemplateError> {
    let instruction_values = HashMap::from([("task", task)]);
    let input_values = HashMap::from([
        ("generation_instruction", instruction),
        ("input_context", input),
        ("hypothesis_output", hypothesis),
    ]);
    Ok(FormattedPrompt {
        instruction: substitute(FINETUNE_INST, &instruction_values)?,
        input: substitute(FINETUNE_INPUT, &input_values)?,
    })
}
