// Tests module
// Scenarios: end-to-end finality over the simulated network
// Properties: threshold arithmetic, fork tree reconstruction and pruning
