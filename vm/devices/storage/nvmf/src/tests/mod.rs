// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod connect_tests;
