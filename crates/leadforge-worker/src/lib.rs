// Leadforge Worker - drives lead-magnet jobs end to end
//
// Control flow:
// JobController -> (loop) StepExecutor -> StrategyDispatcher ->
//   (ResponsesApi | ShellLoop | ComputerLoop | ImagePipeline) ->
//   ArtifactService -> RecordStore -> final assembly -> Delivery

pub mod artifacts;
pub mod browser;
pub mod controller;
pub mod delivery;
pub mod dispatch;
pub mod executor;
pub mod html;
pub mod images;
pub mod live;
pub mod s3upload;
pub mod shell;
pub mod strategies;
pub mod usage;

pub use controller::JobController;
pub use executor::StepExecutor;
