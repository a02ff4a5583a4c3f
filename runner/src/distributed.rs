pub mod fs;
pub mod util;


/*
 * Coordination model between the coordinator and the workers:
 *
 * -> no coordination service, the shared drive is the only shared state
 *   -> descriptors are addressed by file name: {worker}_{param_name}_{job_name}.yaml
 *   -> a worker claims a descriptor by renaming it with the processing prefix,
 *      rename(2) is atomic within a volume so only one process can win
 *   -> once the claim is dropped the descriptor is renamed to the done prefix
 * -> the watcher on each worker (re)starts the run loop when the entry point arrives
 *   -> pushing the entry point without staged descriptors is how jobs are killed
 *
 * Known gaps:
 * 1. nothing acknowledges that a killed job actually stopped
 * 2. a worker crashing mid-job leaves a processing descriptor behind, `fleet status` shows it
 */
