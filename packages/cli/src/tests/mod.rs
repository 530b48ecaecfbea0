// ABOUTME: Unit tests for the server binary library
// ABOUTME: Environment configuration parsing and the assembled HTTP app

mod config_tests;
