use std::collections::HashMap;

use skein_client::{ClientError, ExecutionClient};
use skein_kernel::ExecutionResult;

/// Execution backend seam for the code interpreter. The production
/// implementation forwards to the execution service over HTTP/SSE; tests
/// use a scripted executor.
pub trait CodeExecutor: Send {
    fn start(&mut self) -> Result<(), ClientError>;
    fn stop(&mut self) -> Result<(), ClientError>;
    fn execute(
        &mut self,
        exec_id: &str,
        code: &str,
        on_output: Option<&mut dyn FnMut(&str, &str)>,
    ) -> Result<ExecutionResult, ClientError>;
    fn update_variables(&mut self, variables: &HashMap<String, String>) -> Result<(), ClientError>;
    fn upload_file(&mut self, filename: &str, content: &[u8]) -> Result<String, ClientError>;
    /// Working directory of the underlying session, once known.
    fn cwd(&self) -> Option<String>;
}

impl CodeExecutor for ExecutionClient {
    fn start(&mut self) -> Result<(), ClientError> {
        ExecutionClient::start(self)
    }

    fn stop(&mut self) -> Result<(), ClientError> {
        ExecutionClient::stop(self)
    }

    fn execute(
        &mut self,
        exec_id: &str,
        code: &str,
        on_output: Option<&mut dyn FnMut(&str, &str)>,
    ) -> Result<ExecutionResult, ClientError> {
        ExecutionClient::execute(self, exec_id, code, on_output)
    }

    fn update_variables(&mut self, variables: &HashMap<String, String>) -> Result<(), ClientError> {
        ExecutionClient::update_variables(self, variables)
    }

    fn upload_file(&mut self, filename: &str, content: &[u8]) -> Result<String, ClientError> {
        ExecutionClient::upload_file(self, filename, content)
    }

    fn cwd(&self) -> Option<String> {
        ExecutionClient::cwd(self).map(String::from)
    }
}
